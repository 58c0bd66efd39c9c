//! Text extraction for uploaded documents.
//!
//! The upload surface hands the pipeline raw bytes plus a declared format;
//! this module turns them into plain UTF-8 text. PDF goes through
//! `pdf-extract`; DOCX is unzipped and the `<w:t>` runs of
//! `word/document.xml` are collected; plain text is decoded as UTF-8 with a
//! lossy fallback for stray legacy encodings.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Declared source format of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::PlainText => "txt",
        }
    }

    /// Parse a declared format or filename extension.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.trim().to_lowercase().as_str() {
            "pdf" => Ok(DocumentFormat::Pdf),
            "docx" | "doc" => Ok(DocumentFormat::Docx),
            "txt" | "text" | "plain" | "md" => Ok(DocumentFormat::PlainText),
            other => Err(EngineError::Validation(format!(
                "unsupported document format: {}",
                other
            ))),
        }
    }
}

/// Decompressed-size ceiling for a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extract plain text from document bytes according to the declared format.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String, EngineError> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
        DocumentFormat::PlainText => Ok(extract_plain(bytes)),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, EngineError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map(|text| text.trim().to_string())
        .map_err(|e| EngineError::Validation(format!("PDF extraction failed: {}", e)))
}

fn extract_docx(bytes: &[u8]) -> Result<String, EngineError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| EngineError::Validation(format!("DOCX is not a valid archive: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| EngineError::Validation("DOCX has no word/document.xml".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| EngineError::Validation(format!("DOCX read failed: {}", e)))?;
    }
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(EngineError::Validation(
            "DOCX document.xml exceeds size limit".to_string(),
        ));
    }

    collect_text_runs(&doc_xml)
}

/// Collect `<w:t>` text runs, inserting a newline at each paragraph end so
/// the chunker still sees paragraph boundaries.
fn collect_text_runs(xml: &[u8]) -> Result<String, EngineError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text_run => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"t" => in_text_run = false,
                    b"p" => out.push('\n'),
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::Validation(format!(
                    "DOCX XML parse failed: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim().to_string())
}

fn extract_plain(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim().to_string(),
        Err(_) => String::from_utf8_lossy(bytes).trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_declared_formats() {
        assert_eq!(DocumentFormat::parse("PDF").unwrap(), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::parse("docx").unwrap(), DocumentFormat::Docx);
        assert_eq!(
            DocumentFormat::parse("txt").unwrap(),
            DocumentFormat::PlainText
        );
        assert!(DocumentFormat::parse("xlsx").is_err());
    }

    #[test]
    fn plain_text_decodes_lossy() {
        assert_eq!(extract_plain(b"  hello world \n"), "hello world");
        // Invalid UTF-8 falls back instead of failing.
        let text = extract_plain(&[0x68, 0x69, 0xFF]);
        assert!(text.starts_with("hi"));
    }

    #[test]
    fn docx_text_runs_are_collected() {
        let xml = br#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second</w:t></w:r><w:r><w:t> paragraph.</w:t></w:r></w:p>
              </w:body>
            </w:document>"#;

        let mut zip_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(xml).unwrap();
            writer.finish().unwrap();
        }

        let text = extract_docx(&zip_bytes).unwrap();
        assert!(text.contains("First paragraph."));
        assert!(text.contains("Second paragraph."));
        let first_line = text.lines().next().unwrap();
        assert_eq!(first_line, "First paragraph.");
    }

    #[test]
    fn docx_without_document_xml_is_rejected() {
        let mut zip_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            writer
                .start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"<x/>").unwrap();
            writer.finish().unwrap();
        }
        assert!(matches!(
            extract_docx(&zip_bytes),
            Err(EngineError::Validation(_))
        ));
    }
}
