use crate::error::PipelineError;
use crate::language::{resolve_language, Language, LanguageDetector};
use crate::models::Page;
use crate::services::{OcrEngine, OcrRequest, Summarizer, Translator};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

/// Word budget for one translation request.
pub const TRANSLATION_TOKEN_BUDGET: usize = 500;
pub const SUMMARY_MAX_WORDS: usize = 100;

const STRIP_PATTERN: &str = r"[^\w\s\x{0900}-\x{0D7F}]";
const SENTENCE_END_PATTERN: &str = r"[.?!]\s+";

/// One extracted unit on its way to becoming a [`Page`].
#[derive(Debug, Clone, Copy)]
pub struct PageInput<'a> {
    pub source: &'a str,
    pub unit_index: usize,
    pub raw_text: &'a str,
    /// The page as a one-page PDF, used for OCR when the unit has no extractable glyphs.
    pub pdf: Option<&'a [u8]>,
}

/// Cleans, translates, de-duplicates and summarizes one page. External step failures are
/// logged and degrade the affected field to empty text.
pub struct PageNormalizer {
    detector: Arc<dyn LanguageDetector>,
    ocr: Arc<dyn OcrEngine>,
    translator: Arc<dyn Translator>,
    summarizer: Arc<dyn Summarizer>,
    translation_budget: usize,
    summary_words: usize,
    strip: Regex,
    sentence_end: Regex,
}

impl PageNormalizer {
    pub fn new(
        detector: Arc<dyn LanguageDetector>,
        ocr: Arc<dyn OcrEngine>,
        translator: Arc<dyn Translator>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            detector,
            ocr,
            translator,
            summarizer,
            translation_budget: TRANSLATION_TOKEN_BUDGET,
            summary_words: SUMMARY_MAX_WORDS,
            strip: Regex::new(STRIP_PATTERN)?,
            sentence_end: Regex::new(SENTENCE_END_PATTERN)?,
        })
    }

    pub fn with_translation_budget(mut self, budget: usize) -> Self {
        self.translation_budget = budget.max(1);
        self
    }

    pub fn normalize(&self, input: PageInput<'_>, requested_language: &str) -> Page {
        let page_number = (input.unit_index + 1) as u32;
        let raw = self.raw_or_ocr(input, page_number, requested_language);
        let content_original = self.clean(&raw);

        let language = resolve_language(requested_language, &content_original, self.detector.as_ref());
        let canonical = Language::canonical();

        let translated = if language.is_canonical() {
            content_original.clone()
        } else {
            match self.translate(&content_original, language, canonical) {
                Ok(text) => text,
                Err(error) => {
                    warn!(
                        source = input.source,
                        page = page_number,
                        language = language.iso639_1,
                        %error,
                        "translation failed, page contributes no text"
                    );
                    String::new()
                }
            }
        };

        let content_en = self.deduplicate(&translated);
        let summary = self.summarize(&content_en, input.source, page_number);

        Page {
            source: input.source.to_string(),
            page_number,
            ordinal: page_number,
            original_language: language.iso639_1.to_string(),
            content_original,
            content_en,
            summary,
        }
    }

    fn raw_or_ocr(&self, input: PageInput<'_>, page_number: u32, requested_language: &str) -> String {
        let pdf = match input.pdf {
            Some(pdf) if input.raw_text.trim().is_empty() => pdf,
            _ => return input.raw_text.to_string(),
        };

        let request = OcrRequest {
            source: input.source,
            pdf,
            pdf_page: 1,
            page_number,
            language: Language::ocr_code_for(requested_language),
        };

        match self.ocr.recognize(request) {
            Ok(text) => text,
            Err(error) => {
                warn!(source = input.source, page = page_number, %error, "ocr failed");
                String::new()
            }
        }
    }

    /// NFKC-normalizes, strips everything but word characters, whitespace and Indic scripts,
    /// then collapses whitespace.
    pub fn clean(&self, text: &str) -> String {
        let composed: String = text.nfkc().collect();
        let stripped = self.strip.replace_all(&composed, "");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn translate(
        &self,
        text: &str,
        source: &Language,
        target: &Language,
    ) -> Result<String, PipelineError> {
        let segments = split_by_word_budget(text, self.translation_budget);
        debug!(segments = segments.len(), language = source.iso639_1, "translating");

        let translated = segments
            .iter()
            .map(|segment| self.translator.translate(segment, source, target))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(translated.join(" "))
    }

    /// Drops repeated sentences, keeping the first occurrence of each.
    pub fn deduplicate(&self, text: &str) -> String {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();

        for sentence in split_sentences(&self.sentence_end, text) {
            let sentence = sentence.trim();
            if !sentence.is_empty() && seen.insert(sentence) {
                kept.push(sentence);
            }
        }

        kept.join(" ")
    }

    fn summarize(&self, text: &str, source: &str, page_number: u32) -> String {
        if text.trim().is_empty() {
            return String::new();
        }

        match self.summarizer.summarize(text, self.summary_words) {
            Ok(summary) => crate::services::truncate_words(&summary, self.summary_words),
            Err(error) => {
                warn!(source, page = page_number, %error, "summarization failed");
                String::new()
            }
        }
    }
}

fn split_sentences<'a>(sentence_end: &Regex, text: &'a str) -> Vec<&'a str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for boundary in sentence_end.find_iter(text) {
        // The terminator is a single ASCII byte and stays with its sentence.
        sentences.push(&text[start..boundary.start() + 1]);
        start = boundary.end();
    }
    sentences.push(&text[start..]);
    sentences
}

/// Greedily packs whole words into segments of at most `max_words` words.
pub fn split_by_word_budget(text: &str, max_words: usize) -> Vec<String> {
    let max_words = max_words.max(1);
    let words: Vec<&str> = text.split_whitespace().collect();
    words.chunks(max_words).map(|segment| segment.join(" ")).collect()
}
