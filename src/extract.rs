//! Block extraction from files on disk.
//!
//! | Extension | Blocks |
//! |-----------|--------|
//! | `.json` | a block list: `[{"type": "text"|"table", "content": ...}]` |
//! | `.txt`, `.md` | one text block per blank-line separated paragraph |
//! | `.docx` | body paragraphs and tables, in document order |
//! | `.pdf` | one text block per page, whitespace collapsed |
//!
//! Empty paragraphs and separator lines (`---`, `___`) are dropped. Word
//! paragraphs broken mid-sentence are merged back with their neighbour.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use thiserror::Error;

use crate::models::{parse_blocks, Block, RawBlock};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extensions [`extract_blocks`] understands.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["json", "txt", "md", "docx", "pdf"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid block list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Read `path` and parse it into blocks based on its extension.
pub fn extract_blocks(path: &Path) -> Result<Vec<Block>, ExtractError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "json" => {
            let raw: Vec<RawBlock> = serde_json::from_slice(&std::fs::read(path)?)?;
            Ok(parse_blocks(raw))
        }
        "txt" | "md" => Ok(text_blocks(&std::fs::read_to_string(path)?)),
        "docx" => docx_blocks(&std::fs::read(path)?),
        "pdf" => pdf_blocks(&std::fs::read(path)?),
        other => Err(ExtractError::UnsupportedFileType(other.to_string())),
    }
}

/// Split plain text into paragraph blocks on blank lines.
pub fn text_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    for line in text.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if !paragraph.is_empty() {
                blocks.push(Block::Text(paragraph.join("\n")));
                paragraph.clear();
            }
        } else {
            paragraph.push(line.trim_end());
        }
    }
    clean_blocks(blocks)
}

fn is_separator(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    chars.len() >= 3 && chars.iter().all(|c| *c == '-' || *c == '_')
}

/// Trim text blocks, dropping empty ones and separator lines.
pub fn clean_blocks(blocks: Vec<Block>) -> Vec<Block> {
    blocks
        .into_iter()
        .filter_map(|b| match b {
            Block::Text(t) => {
                let t = t.trim();
                if t.is_empty() || is_separator(t) {
                    None
                } else {
                    Some(Block::Text(t.to_string()))
                }
            }
            table => Some(table),
        })
        .collect()
}

/// Whether `next` continues the paragraph `prev` (a line broken inside a
/// sentence or a heading split across paragraphs).
fn continues(prev: &str, next: &str) -> bool {
    let (prev, next) = (prev.trim(), next.trim());
    let (Some(last), Some(first)) = (prev.chars().last(), next.chars().next()) else {
        return false;
    };

    let is_upper = |s: &str| s.chars().any(char::is_alphabetic) && !s.chars().any(char::is_lowercase);
    if is_upper(prev) && is_upper(next) {
        return true;
    }
    if prev.ends_with([',', ':']) {
        return true;
    }
    if prev.ends_with(['.', '!', '?']) {
        return false;
    }
    if prev.chars().count() > 40 {
        return true;
    }
    last.is_alphanumeric() && first.is_lowercase()
}

/// Merge consecutive text blocks that belong to one paragraph.
pub fn merge_paragraphs(blocks: Vec<Block>) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::new();
    for block in blocks {
        match (out.last_mut(), block) {
            (Some(Block::Text(prev)), Block::Text(next)) if continues(prev, &next) => {
                prev.push(' ');
                prev.push_str(next.trim());
            }
            (_, block) => out.push(block),
        }
    }
    out
}

fn read_docx_document(bytes: &[u8]) -> Result<Vec<u8>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    Ok(xml)
}

fn docx_blocks(bytes: &[u8]) -> Result<Vec<Block>, ExtractError> {
    let xml = read_docx_document(bytes)?;
    let blocks = parse_document_xml(&xml)?;
    Ok(merge_paragraphs(clean_blocks(blocks)))
}

/// Walk `word/document.xml`: top-level `w:p` become text blocks, `w:tbl`
/// become tables with one cell per `w:tc` (nested paragraphs concatenated).
fn parse_document_xml(xml: &[u8]) -> Result<Vec<Block>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut blocks = Vec::new();
    let mut table_depth = 0usize;
    let mut in_text = false;
    let mut paragraph = String::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        rows.clear();
                    }
                }
                b"tr" if table_depth == 1 => row.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                b"p" if table_depth == 0 => paragraph.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" if table_depth == 0 => paragraph.push('\t'),
                b"br" if table_depth == 0 => paragraph.push('\n'),
                b"p" if table_depth == 0 => blocks.push(Block::Text(String::new())),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Docx(e.to_string()))?;
                if table_depth == 0 {
                    paragraph.push_str(&text);
                } else {
                    cell.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if table_depth == 0 => {
                    blocks.push(Block::Text(std::mem::take(&mut paragraph)));
                }
                b"tc" if table_depth == 1 => row.push(std::mem::take(&mut cell)),
                b"tr" if table_depth == 1 => rows.push(std::mem::take(&mut row)),
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        blocks.push(Block::Table(std::mem::take(&mut rows)));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(blocks)
}

fn pdf_blocks(bytes: &[u8]) -> Result<Vec<Block>, ExtractError> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(pdf_pages_to_blocks(&text))
}

/// One block per form-feed separated page, whitespace collapsed. Pages with
/// almost no text (scans) are dropped.
fn pdf_pages_to_blocks(text: &str) -> Vec<Block> {
    text.split('\u{c}')
        .map(|page| page.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|page| page.chars().filter(|c| !c.is_whitespace()).count() > 5)
        .map(Block::Text)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_bytes(document_xml: &str) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_unsupported_extension() {
        let err = extract_blocks(Path::new("notes.xyz")).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFileType(e) if e == "xyz"));
    }

    #[test]
    fn test_invalid_zip_returns_error_for_docx() {
        assert!(matches!(docx_blocks(b"not a zip"), Err(ExtractError::Docx(_))));
    }

    #[test]
    fn test_text_blocks_split_on_blank_lines() {
        let blocks = text_blocks("First para\nstill first.\n\n---\n\n  \nSecond para.\n");
        assert_eq!(
            blocks,
            vec![
                Block::Text("First para\nstill first.".to_string()),
                Block::Text("Second para.".to_string()),
            ]
        );
    }

    #[test]
    fn test_separator_detection() {
        assert!(is_separator("---"));
        assert!(is_separator("_____"));
        assert!(is_separator("-_-"));
        assert!(!is_separator("--"));
        assert!(!is_separator("- item"));
    }

    #[test]
    fn test_merge_paragraphs() {
        let blocks = vec![
            Block::Text("TERMS AND".to_string()),
            Block::Text("CONDITIONS".to_string()),
            Block::Text("The supplier shall deliver".to_string()),
            Block::Text("goods on time.".to_string()),
            Block::Text("Next sentence.".to_string()),
            Block::Table(vec![vec!["a".to_string()]]),
            Block::Text("Payment due:".to_string()),
            Block::Text("Within 30 days.".to_string()),
        ];
        let merged = merge_paragraphs(blocks);
        assert_eq!(
            merged,
            vec![
                Block::Text("TERMS AND CONDITIONS".to_string()),
                Block::Text("The supplier shall deliver goods on time.".to_string()),
                Block::Text("Next sentence.".to_string()),
                Block::Table(vec![vec!["a".to_string()]]),
                Block::Text("Payment due: Within 30 days.".to_string()),
            ]
        );
    }

    #[test]
    fn test_docx_paragraphs_and_tables() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Delivery terms.</w:t></w:r></w:p>
    <w:p/>
    <w:p><w:r><w:t>___</w:t></w:r></w:p>
    <w:tbl>
      <w:tr>
        <w:tc><w:p><w:r><w:t>Item</w:t></w:r></w:p></w:tc>
        <w:tc><w:p><w:r><w:t>Days</w:t></w:r></w:p></w:tc>
      </w:tr>
      <w:tr>
        <w:tc><w:p><w:r><w:t>Steel</w:t></w:r></w:p></w:tc>
        <w:tc><w:p><w:r><w:t>3</w:t></w:r><w:r><w:t>0</w:t></w:r></w:p></w:tc>
      </w:tr>
    </w:tbl>
    <w:p><w:r><w:t xml:space="preserve">Penalty &amp; fees apply.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let blocks = docx_blocks(&docx_bytes(xml)).unwrap();
        assert_eq!(
            blocks,
            vec![
                Block::Text("Delivery terms.".to_string()),
                Block::Table(vec![
                    vec!["Item".to_string(), "Days".to_string()],
                    vec!["Steel".to_string(), "30".to_string()],
                ]),
                Block::Text("Penalty & fees apply.".to_string()),
            ]
        );
    }

    #[test]
    fn test_docx_missing_document_xml() {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = docx_blocks(&buf.into_inner()).unwrap_err();
        assert!(err.to_string().contains("word/document.xml not found"));
    }

    #[test]
    fn test_pdf_pages_to_blocks() {
        let blocks = pdf_pages_to_blocks("Page one\ntext  here.\u{c}  \n\u{c}x y\u{c}Third page text.");
        assert_eq!(
            blocks,
            vec![
                Block::Text("Page one text here.".to_string()),
                Block::Text("Third page text.".to_string()),
            ]
        );
    }

    #[test]
    fn test_json_block_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(
            &path,
            r#"[{"type": "text", "content": "Hello."}, {"type": "image"}, {"type": "table", "content": [["a"]]}]"#,
        )
        .unwrap();
        let blocks = extract_blocks(&path).unwrap();
        assert_eq!(blocks.len(), 2);
    }
}
