use tracing::debug;

/// Minimum cleaned length (in characters) before automatic detection is attempted.
pub const MIN_DETECTION_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Language {
    pub iso639_1: &'static str,
    pub iso639_3: &'static str,
    /// Code understood by the translation model (`<lang>_<script>`).
    pub translation_code: &'static str,
    pub ocr_code: &'static str,
}

const fn language(
    iso639_1: &'static str,
    iso639_3: &'static str,
    translation_code: &'static str,
    ocr_code: &'static str,
) -> Language {
    Language {
        iso639_1,
        iso639_3,
        translation_code,
        ocr_code,
    }
}

pub const ENGLISH: Language = language("en", "eng", "eng_Latn", "eng");

pub static LANGUAGES: [Language; 11] = [
    language("hi", "hin", "hin_Deva", "hin"),
    language("ta", "tam", "tam_Taml", "tam"),
    language("te", "tel", "tel_Telu", "tel"),
    language("bn", "ben", "ben_Beng", "ben"),
    language("gu", "guj", "guj_Gujr", "guj"),
    language("kn", "kan", "kan_Knda", "kan"),
    language("ml", "mal", "mal_Mlym", "mal"),
    language("mr", "mar", "mar_Deva", "mar"),
    language("pa", "pan", "pan_Guru", "pan"),
    language("or", "ory", "ory_Orya", "ori"),
    ENGLISH,
];

impl Language {
    pub fn canonical() -> &'static Language {
        &LANGUAGES[LANGUAGES.len() - 1]
    }

    pub fn lookup(code: &str) -> Option<&'static Language> {
        let code = code.trim().to_ascii_lowercase();
        if code.is_empty() {
            return None;
        }

        LANGUAGES.iter().find(|language| {
            language.iso639_1 == code
                || language.iso639_3 == code
                || language.ocr_code == code
                || language.translation_code.eq_ignore_ascii_case(&code)
        })
    }

    pub fn is_canonical(&self) -> bool {
        self == Self::canonical()
    }

    /// OCR trained-data code for a requested language, defaulting to the canonical one.
    pub fn ocr_code_for(code: &str) -> &'static str {
        Self::lookup(code).unwrap_or(Self::canonical()).ocr_code
    }
}

pub trait LanguageDetector: Send + Sync {
    /// Returns a language code for the text, or `None` when detection is inconclusive.
    fn detect(&self, text: &str) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WhatlangDetector;

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Option<String> {
        whatlang::detect(text).map(|info| info.lang().code().to_string())
    }
}

/// Picks the language a page is treated as.
///
/// An empty or canonical request triggers detection on texts of at least
/// [`MIN_DETECTION_CHARS`] characters; any other request is taken as given. Short text, failed
/// detection and codes missing from [`LANGUAGES`] all resolve to the canonical language.
pub fn resolve_language(
    requested: &str,
    cleaned: &str,
    detector: &dyn LanguageDetector,
) -> &'static Language {
    let canonical = Language::canonical();
    let explicit = Language::lookup(requested).filter(|language| !language.is_canonical());

    if let Some(language) = explicit {
        return language;
    }

    if !requested.trim().is_empty() && Language::lookup(requested).is_none() {
        debug!(requested, "requested language not supported, detecting instead");
    }

    if cleaned.chars().count() < MIN_DETECTION_CHARS {
        return canonical;
    }

    match detector.detect(cleaned) {
        Some(code) => Language::lookup(&code).unwrap_or_else(|| {
            debug!(detected = %code, "no translation mapping for detected language");
            canonical
        }),
        None => canonical,
    }
}
