//! Language detection and the per-language boundary heuristics used by the chunker.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

/// Languages the chunker recognizes by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Kotlin,
    CSharp,
    C,
    Cpp,
    Ruby,
    Markdown,
    /// Anything else. Always chunked with the plain sliding window.
    Text,
}

impl Language {
    /// Detect the language of a file from its extension.
    ///
    /// `README`/`CHANGELOG` files without an extension are treated as Markdown.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("rs") => Language::Rust,
            Some("py") | Some("pyi") => Language::Python,
            Some("js") | Some("jsx") | Some("mjs") | Some("cjs") => Language::JavaScript,
            Some("ts") | Some("tsx") | Some("mts") => Language::TypeScript,
            Some("go") => Language::Go,
            Some("java") => Language::Java,
            Some("kt") | Some("kts") => Language::Kotlin,
            Some("cs") => Language::CSharp,
            Some("c") | Some("h") => Language::C,
            Some("cc") | Some("cpp") | Some("cxx") | Some("hpp") | Some("hh") => Language::Cpp,
            Some("rb") => Language::Ruby,
            Some("md") | Some("markdown") => Language::Markdown,
            _ => {
                if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                    if filename.starts_with("README") || filename.starts_with("CHANGELOG") {
                        return Language::Markdown;
                    }
                }
                Language::Text
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Java => "java",
            Language::Kotlin => "kotlin",
            Language::CSharp => "csharp",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Ruby => "ruby",
            Language::Markdown => "markdown",
            Language::Text => "text",
        }
    }

    /// Boundary rules for this language, if it has any that compiled.
    pub(crate) fn rules(&self) -> Option<&'static BoundaryRules> {
        RULES.get(self)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rust" => Ok(Language::Rust),
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::JavaScript),
            "typescript" => Ok(Language::TypeScript),
            "go" => Ok(Language::Go),
            "java" => Ok(Language::Java),
            "kotlin" => Ok(Language::Kotlin),
            "csharp" => Ok(Language::CSharp),
            "c" => Ok(Language::C),
            "cpp" => Ok(Language::Cpp),
            "ruby" => Ok(Language::Ruby),
            "markdown" => Ok(Language::Markdown),
            "text" => Ok(Language::Text),
            other => Err(format!("unknown language: {other}")),
        }
    }
}

/// Compiled line patterns for one language.
///
/// `boundary` matches a top-level declaration (a good place to start a chunk),
/// `closer` matches a line that ends a top-level unit, and `symbol` captures the
/// declared name in group 1.
#[derive(Debug)]
pub(crate) struct BoundaryRules {
    pub boundary: Regex,
    pub closer: Option<Regex>,
    pub symbol: Regex,
}

struct RuleSource {
    language: Language,
    boundary: &'static str,
    closer: Option<&'static str>,
    symbol: &'static str,
}

const BRACE_CLOSER: Option<&str> = Some(r"^[}\]][;,)]*\s*$");

const RULE_SOURCES: &[RuleSource] = &[
    RuleSource {
        language: Language::Rust,
        boundary: r"^(?:#\[|(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|unsafe|const|extern)\s+)*(?:fn|struct|enum|trait|impl|mod|type|union|macro_rules!)\b)",
        closer: BRACE_CLOSER,
        symbol: r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|unsafe|const|extern)\s+)*(?:fn|struct|enum|trait|mod|type|union)\s+([A-Za-z_]\w*)",
    },
    RuleSource {
        language: Language::Python,
        boundary: r"^(?:@|(?:async\s+)?(?:def|class)\b)",
        closer: None,
        symbol: r"^\s*(?:async\s+)?(?:def|class)\s+([A-Za-z_]\w*)",
    },
    RuleSource {
        language: Language::JavaScript,
        boundary: r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class)\b",
        closer: BRACE_CLOSER,
        symbol: r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class)\s+([A-Za-z_$][\w$]*)",
    },
    RuleSource {
        language: Language::TypeScript,
        boundary: r"^(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|class|interface|enum|type|namespace)\b",
        closer: BRACE_CLOSER,
        symbol: r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|class|interface|enum|type|namespace)\s+([A-Za-z_$][\w$]*)",
    },
    RuleSource {
        language: Language::Go,
        boundary: r"^(?:func|type)\b",
        closer: BRACE_CLOSER,
        symbol: r"^\s*(?:func(?:\s*\([^)]*\))?|type)\s+([A-Za-z_]\w*)",
    },
    RuleSource {
        language: Language::Java,
        boundary: r"^(?:\s{0,4})(?:@\w+|(?:(?:public|private|protected|static|final|abstract|sealed)\s+)*(?:class|interface|enum|record)\b)",
        closer: Some(r"^\s{0,4}\}\s*$"),
        symbol: r"^\s*(?:(?:public|private|protected|static|final|abstract|sealed)\s+)*(?:class|interface|enum|record)\s+([A-Za-z_]\w*)",
    },
    RuleSource {
        language: Language::Kotlin,
        boundary: r"^(?:(?:public|private|internal|open|data|sealed|abstract|override|suspend)\s+)*(?:fun|class|object|interface)\b",
        closer: BRACE_CLOSER,
        symbol: r"^\s*(?:(?:public|private|internal|open|data|sealed|abstract|override|suspend)\s+)*(?:fun|class|object|interface)\s+([A-Za-z_]\w*)",
    },
    RuleSource {
        language: Language::CSharp,
        boundary: r"^(?:\s{0,4})(?:\[|(?:(?:public|private|protected|internal|static|sealed|abstract|partial)\s+)*(?:class|interface|enum|struct|record|namespace)\b)",
        closer: Some(r"^\s{0,4}\}\s*$"),
        symbol: r"^\s*(?:(?:public|private|protected|internal|static|sealed|abstract|partial)\s+)*(?:class|interface|enum|struct|record|namespace)\s+([A-Za-z_][\w.]*)",
    },
    RuleSource {
        language: Language::C,
        boundary: r"^(?:(?:static|inline|extern)\s+)*(?:struct|enum|union|typedef|[A-Za-z_][\w\s\*]*\s+\**[A-Za-z_]\w*\s*\()",
        closer: BRACE_CLOSER,
        symbol: r"^(?:(?:static|inline|extern)\s+)*(?:struct|enum|union)\s+([A-Za-z_]\w*)|^[A-Za-z_][\w\s\*]*\s+\**([A-Za-z_]\w*)\s*\(",
    },
    RuleSource {
        language: Language::Cpp,
        boundary: r"^(?:template\s*<|namespace\b|(?:class|struct|enum|union)\b|[A-Za-z_][\w:<>\s\*&]*\s+[\*&]*[A-Za-z_][\w:]*\s*\()",
        closer: BRACE_CLOSER,
        symbol: r"^\s*(?:class|struct|enum(?:\s+class)?|union|namespace)\s+([A-Za-z_]\w*)|^[A-Za-z_][\w:<>\s\*&]*\s+[\*&]*([A-Za-z_][\w:]*)\s*\(",
    },
    RuleSource {
        language: Language::Ruby,
        boundary: r"^\s{0,2}(?:def|class|module)\b",
        closer: Some(r"^\s{0,2}end\s*$"),
        symbol: r"^\s*(?:def|class|module)\s+(?:self\.)?([A-Za-z_]\w*[?!]?)",
    },
    RuleSource {
        language: Language::Markdown,
        boundary: r"^#{1,6}\s",
        closer: None,
        symbol: r"^#{1,6}\s+(.+?)\s*$",
    },
];

/// Rules whose patterns fail to compile are left out, which sends that language
/// down the sliding-window path.
static RULES: LazyLock<HashMap<Language, BoundaryRules>> = LazyLock::new(|| {
    RULE_SOURCES
        .iter()
        .filter_map(|source| {
            let boundary = Regex::new(source.boundary).ok()?;
            let symbol = Regex::new(source.symbol).ok()?;
            let closer = match source.closer {
                Some(pattern) => Some(Regex::new(pattern).ok()?),
                None => None,
            };
            Some((
                source.language,
                BoundaryRules {
                    boundary,
                    closer,
                    symbol,
                },
            ))
        })
        .collect()
});

impl BoundaryRules {
    /// First declared name on `line`, from whichever capture group matched.
    pub fn symbol_name(&self, line: &str) -> Option<String> {
        let captures = self.symbol.captures(line)?;
        captures
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_languages_by_extension() {
        assert_eq!(Language::from_path(Path::new("src/main.rs")), Language::Rust);
        assert_eq!(Language::from_path(Path::new("app/models.PY")), Language::Python);
        assert_eq!(Language::from_path(Path::new("web/index.tsx")), Language::TypeScript);
        assert_eq!(Language::from_path(Path::new("README")), Language::Markdown);
        assert_eq!(Language::from_path(Path::new("data.bin")), Language::Text);
        assert_eq!(Language::from_path(Path::new("Makefile")), Language::Text);
    }

    #[test]
    fn every_rule_set_compiles() {
        for source in RULE_SOURCES {
            assert!(
                source.language.rules().is_some(),
                "rules for {} failed to compile",
                source.language
            );
        }
        assert!(Language::Text.rules().is_none());
    }

    #[test]
    fn extracts_symbol_names() {
        let rust = Language::Rust.rules().unwrap();
        assert_eq!(
            rust.symbol_name("pub(crate) async fn load_index(path: &Path) {"),
            Some("load_index".to_string())
        );
        assert_eq!(rust.symbol_name("    let x = 1;"), None);

        let go = Language::Go.rules().unwrap();
        assert_eq!(
            go.symbol_name("func (s *Server) Handle(w http.ResponseWriter) {"),
            Some("Handle".to_string())
        );

        let c = Language::C.rules().unwrap();
        assert_eq!(
            c.symbol_name("static int parse_header(const char *buf) {"),
            Some("parse_header".to_string())
        );

        let md = Language::Markdown.rules().unwrap();
        assert_eq!(md.symbol_name("## Getting started"), Some("Getting started".to_string()));
    }

    #[test]
    fn language_names_round_trip_through_from_str() {
        assert_eq!("rust".parse::<Language>(), Ok(Language::Rust));
        assert_eq!("CSharp".parse::<Language>(), Ok(Language::CSharp));
        assert!("cobol".parse::<Language>().is_err());
    }
}
