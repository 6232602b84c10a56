use clap::Parser;
use serde::Serialize;
use sift_context::{ChunkOptions, chunk};
use std::fs;
use std::io::{self, Read};

/// Print the chunks sift would index for a file, as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Path recorded on each chunk. Defaults to --input; also selects the language.
    #[arg(short, long)]
    path: Option<String>,

    /// Maximum lines per chunk.
    #[arg(short, long, default_value_t = 50)]
    max_lines: usize,

    /// Lines shared by consecutive chunks.
    #[arg(short, long, default_value_t = 10)]
    overlap_lines: usize,

    /// Disable declaration-aware window ends.
    #[arg(long)]
    plain: bool,

    /// Include the passage text sent to the embedding model.
    #[arg(long)]
    passages: bool,
}

#[derive(Serialize)]
struct ChunkView<'a> {
    id: &'a str,
    start_line: usize,
    end_line: usize,
    symbol_name: Option<&'a str>,
    language: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    passage: Option<String>,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let file_content = if let Some(input_path) = &args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let path = args
        .path
        .clone()
        .or_else(|| args.input.clone())
        .unwrap_or_else(|| "stdin".to_string());

    let options = ChunkOptions {
        max_lines: args.max_lines,
        overlap_lines: args.overlap_lines,
        structure_aware: !args.plain,
    };
    if let Err(e) = options.validate() {
        eprintln!("warning: {e}; values will be clamped");
    }

    let chunks = chunk(&path, &file_content, &options);
    let views: Vec<ChunkView> = chunks
        .iter()
        .map(|c| ChunkView {
            id: &c.id,
            start_line: c.start_line,
            end_line: c.end_line,
            symbol_name: c.symbol_name.as_deref(),
            language: &c.language,
            content: &c.content,
            passage: args.passages.then(|| c.embedding_text()),
        })
        .collect();

    let json_output = serde_json::to_string_pretty(&views)?;
    println!("{}", json_output);

    Ok(())
}
