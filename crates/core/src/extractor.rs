use crate::error::PipelineError;
use crate::models::{Document, DocumentFormat, ExtractedUnit};
use lopdf::Document as PdfDocument;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

/// Turns uploaded bytes into per-unit raw text.
///
/// PDFs yield one unit per page in page order, including pages without extractable glyphs (their
/// text is empty and left for OCR). A CSV yields a single unit of space-joined data cells.
#[derive(Debug, Default, Clone)]
pub struct TextExtractor {
    staging_dir: Option<PathBuf>,
}

impl TextExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages PDF bytes under `dir` instead of the system temp directory.
    pub fn with_staging_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: Some(dir.into()),
        }
    }

    pub fn extract(&self, document: &Document) -> Result<Vec<ExtractedUnit>, PipelineError> {
        match document.resolve_format()? {
            DocumentFormat::Pdf => self.extract_pdf(document),
            DocumentFormat::Csv => extract_csv(&document.bytes),
        }
    }

    fn extract_pdf(&self, document: &Document) -> Result<Vec<ExtractedUnit>, PipelineError> {
        // Removed on drop, whichever way this function returns.
        let staged = self.stage(&document.bytes)?;
        let pdf = PdfDocument::load(staged.path())
            .map_err(|error| PipelineError::PdfParse(format!("{}: {error}", document.name)))?;

        let page_numbers: Vec<u32> = pdf.get_pages().into_keys().collect();
        let units = page_numbers
            .iter()
            .enumerate()
            .map(|(unit_index, &page_no)| {
                let text = pdf.extract_text(&[page_no]).unwrap_or_else(|error| {
                    debug!(document = %document.name, page = page_no, %error, "no text layer");
                    String::new()
                });
                let page_pdf = if text.trim().is_empty() {
                    single_page_pdf(&pdf, &page_numbers, page_no, &document.name)
                } else {
                    None
                };
                ExtractedUnit {
                    unit_index,
                    text,
                    page_pdf,
                }
            })
            .collect::<Vec<_>>();

        if units.is_empty() {
            return Err(PipelineError::PdfParse(format!(
                "pdf has no pages: {}",
                document.name
            )));
        }

        Ok(units)
    }

    fn stage(&self, bytes: &[u8]) -> Result<NamedTempFile, PipelineError> {
        let mut staged = match &self.staging_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        staged.write_all(bytes)?;
        staged.flush()?;
        Ok(staged)
    }
}

/// Copy of `pdf` reduced to `page_no`, so OCR uploads one page instead of the whole file.
fn single_page_pdf(pdf: &PdfDocument, all_pages: &[u32], page_no: u32, name: &str) -> Option<Vec<u8>> {
    let others: Vec<u32> = all_pages.iter().copied().filter(|&n| n != page_no).collect();
    let mut page = pdf.clone();
    page.delete_pages(&others);
    page.prune_objects();

    let mut bytes = Vec::new();
    match page.save_to(&mut bytes) {
        Ok(()) => Some(bytes),
        Err(error) => {
            debug!(document = %name, page = page_no, %error, "could not split page for ocr");
            None
        }
    }
}

fn extract_csv(bytes: &[u8]) -> Result<Vec<ExtractedUnit>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let mut cells = Vec::new();
    for record in reader.records() {
        let record = record?;
        cells.extend(record.iter().map(str::to_string));
    }

    Ok(vec![ExtractedUnit {
        unit_index: 0,
        text: cells.join(" "),
        page_pdf: None,
    }])
}

/// Recursively lists PDF and CSV files under `folder`, sorted by path.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf") || ext.eq_ignore_ascii_case("csv"));

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}
