//! Praat TextGrid reading and sentence interval extraction
//!
//! Both the long ("ooTextFile" with `key = value` lines) and the short text
//! formats are accepted. They carry the same sequence of values, so the reader
//! tokenizes the file into strings, numbers and `<flags>` and ignores the
//! keys, brackets and punctuation around them.

use std::path::Path;

use crate::error::{EncodingError, Result, StageOutcome};

/// Half-open span of continuous speech, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentenceInterval {
    pub onset: f64,
    pub offset: f64,
}

impl SentenceInterval {
    pub fn new(onset: f64, offset: f64) -> Self {
        Self { onset, offset }
    }

    pub fn duration(&self) -> f64 {
        self.offset - self.onset
    }
}

/// A labelled interval of an interval tier
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledInterval {
    pub start: f64,
    pub end: f64,
    pub label: String,
}

/// A labelled instant of a point tier
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledPoint {
    pub time: f64,
    pub mark: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tier {
    Interval {
        name: String,
        intervals: Vec<LabeledInterval>,
    },
    Point {
        name: String,
        points: Vec<LabeledPoint>,
    },
}

impl Tier {
    pub fn name(&self) -> &str {
        match self {
            Self::Interval { name, .. } | Self::Point { name, .. } => name,
        }
    }
}

/// Parsed TextGrid
#[derive(Debug, Clone, PartialEq)]
pub struct TextGrid {
    pub xmin: f64,
    pub xmax: f64,
    pub tiers: Vec<Tier>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Number(f64),
    Flag(String),
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => {
                        // "" inside a string is an escaped quote
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            text.push('"');
                        } else {
                            break;
                        }
                    }
                    Some(ch) => text.push(ch),
                    None => return Err("unterminated string".into()),
                }
            }
            tokens.push(Token::Text(text));
        } else if c == '[' {
            // item [1]:, intervals [3]:
            for ch in chars.by_ref() {
                if ch == ']' {
                    break;
                }
            }
        } else if c == '<' {
            let mut flag = String::new();
            for ch in chars.by_ref() {
                flag.push(ch);
                if ch == '>' {
                    break;
                }
            }
            tokens.push(Token::Flag(flag));
        } else if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' {
            let mut number = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E') {
                    number.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = number
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{number}'"))?;
            tokens.push(Token::Number(value));
        } else if c == '=' {
            chars.next();
        } else {
            // keys such as `xmin`, `intervals:`; `=` may follow without a space
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || matches!(ch, '"' | '[' | '=') {
                    break;
                }
                chars.next();
            }
        }
    }

    Ok(tokens)
}

struct Cursor {
    tokens: std::vec::IntoIter<Token>,
}

impl Cursor {
    fn next_text(&mut self, what: &str) -> std::result::Result<String, String> {
        match self.tokens.next() {
            Some(Token::Text(text)) => Ok(text),
            other => Err(format!("expected {what} string, found {other:?}")),
        }
    }

    fn next_number(&mut self, what: &str) -> std::result::Result<f64, String> {
        match self.tokens.next() {
            Some(Token::Number(value)) => Ok(value),
            other => Err(format!("expected {what}, found {other:?}")),
        }
    }

    fn next_count(&mut self, what: &str) -> std::result::Result<usize, String> {
        let value = self.next_number(what)?;
        if value < 0.0 || value.fract() != 0.0 {
            return Err(format!("{what} must be a non-negative integer, got {value}"));
        }
        Ok(value as usize)
    }

    fn next_flag(&mut self) -> std::result::Result<String, String> {
        match self.tokens.next() {
            Some(Token::Flag(flag)) => Ok(flag),
            other => Err(format!("expected <exists> flag, found {other:?}")),
        }
    }
}

impl TextGrid {
    /// Parse TextGrid text in either text format
    pub fn parse(source: &str) -> std::result::Result<Self, String> {
        let mut cursor = Cursor {
            tokens: tokenize(source)?.into_iter(),
        };

        let file_type = cursor.next_text("file type")?;
        if file_type != "ooTextFile" {
            return Err(format!("unsupported file type '{file_type}'"));
        }
        let object_class = cursor.next_text("object class")?;
        if object_class != "TextGrid" {
            return Err(format!("object class is '{object_class}', not TextGrid"));
        }

        let xmin = cursor.next_number("xmin")?;
        let xmax = cursor.next_number("xmax")?;
        if cursor.next_flag()? != "<exists>" {
            return Ok(Self {
                xmin,
                xmax,
                tiers: Vec::new(),
            });
        }

        let n_tiers = cursor.next_count("tier count")?;
        let mut tiers = Vec::with_capacity(n_tiers);
        for _ in 0..n_tiers {
            let class = cursor.next_text("tier class")?;
            let name = cursor.next_text("tier name")?;
            cursor.next_number("tier xmin")?;
            cursor.next_number("tier xmax")?;
            let n_items = cursor.next_count("item count")?;

            let tier = match class.as_str() {
                "IntervalTier" => {
                    let mut intervals = Vec::with_capacity(n_items);
                    for _ in 0..n_items {
                        let start = cursor.next_number("interval xmin")?;
                        let end = cursor.next_number("interval xmax")?;
                        let label = cursor.next_text("interval text")?;
                        intervals.push(LabeledInterval { start, end, label });
                    }
                    Tier::Interval { name, intervals }
                }
                "TextTier" => {
                    let mut points = Vec::with_capacity(n_items);
                    for _ in 0..n_items {
                        let time = cursor.next_number("point time")?;
                        let mark = cursor.next_text("point mark")?;
                        points.push(LabeledPoint { time, mark });
                    }
                    Tier::Point { name, points }
                }
                other => return Err(format!("unknown tier class '{other}'")),
            };
            tiers.push(tier);
        }

        Ok(Self { xmin, xmax, tiers })
    }

    /// Read a TextGrid file, UTF-8 or UTF-16 with byte order mark
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| EncodingError::io(path, e))?;
        let source = decode_text(&bytes);
        Self::parse(&source).map_err(|reason| EncodingError::TextGrid {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Intervals of the first tier, which must be an interval tier
    pub fn first_interval_tier(&self) -> Option<&[LabeledInterval]> {
        match self.tiers.first() {
            Some(Tier::Interval { intervals, .. }) => Some(intervals),
            _ => None,
        }
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let utf16 = |big_endian: bool| {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| {
                if big_endian {
                    u16::from_be_bytes([pair[0], pair[1]])
                } else {
                    u16::from_le_bytes([pair[0], pair[1]])
                }
            })
            .collect();
        String::from_utf16_lossy(&units)
    };
    match bytes {
        [0xFF, 0xFE, ..] => utf16(false),
        [0xFE, 0xFF, ..] => utf16(true),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Labels that structure a word tier into sentences
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceRules {
    /// Label closing the current sentence
    pub boundary: String,
    /// Labels that are neither words nor boundaries
    pub silence: Vec<String>,
}

impl Default for SentenceRules {
    fn default() -> Self {
        Self {
            boundary: "#".to_string(),
            silence: vec!["<sil>".into(), "sp".into(), "SIL".into()],
        }
    }
}

impl SentenceRules {
    pub fn new(boundary: impl Into<String>, silence: Vec<String>) -> Self {
        Self {
            boundary: boundary.into(),
            silence,
        }
    }
}

/// Group word intervals into sentence spans.
///
/// A sentence starts at its first word and ends at the end of its last word.
/// Silence labels neither open nor extend a sentence.
pub fn sentence_intervals(
    intervals: &[LabeledInterval],
    rules: &SentenceRules,
) -> Vec<SentenceInterval> {
    let mut sentences = Vec::new();
    let mut current: Option<SentenceInterval> = None;

    for interval in intervals {
        let label = interval.label.trim();
        if label.is_empty() {
            continue;
        }
        if label == rules.boundary {
            if let Some(sentence) = current.take() {
                sentences.push(sentence);
            }
        } else if !rules.silence.iter().any(|s| s == label) {
            match current.as_mut() {
                Some(sentence) => sentence.offset = interval.end,
                None => current = Some(SentenceInterval::new(interval.start, interval.end)),
            }
        }
    }
    if let Some(sentence) = current {
        sentences.push(sentence);
    }

    sentences
}

/// Extract the sentence spans of a transcript file.
///
/// Missing or malformed files and grids without a leading interval tier are
/// reported as unavailable rather than raised.
pub fn load_sentence_intervals(
    path: &Path,
    rules: &SentenceRules,
) -> StageOutcome<Vec<SentenceInterval>> {
    if !path.exists() {
        return StageOutcome::Unavailable(format!("{} not found", path.display()));
    }
    let grid = match TextGrid::load(path) {
        Ok(grid) => grid,
        Err(e) => return StageOutcome::Unavailable(e.to_string()),
    };
    let Some(words) = grid.first_interval_tier() else {
        return StageOutcome::Unavailable(format!(
            "{} has no leading interval tier",
            path.display()
        ));
    };
    let sentences = sentence_intervals(words, rules);
    if sentences.is_empty() {
        StageOutcome::Unavailable(format!("{} contains no sentences", path.display()))
    } else {
        StageOutcome::Success(sentences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_FORMAT: &str = r##"File type = "ooTextFile"
Object class = "TextGrid"

xmin = 0
xmax = 6.5
tiers? <exists>
size = 2
item []:
    item [1]:
        class = "IntervalTier"
        name = "words"
        xmin = 0
        xmax = 6.5
        intervals: size = 8
        intervals [1]:
            xmin = 0
            xmax = 0.5
            text = "<sil>"
        intervals [2]:
            xmin = 0.5
            xmax = 1.0
            text = "the"
        intervals [3]:
            xmin = 1.0
            xmax = 1.6
            text = "little"
        intervals [4]:
            xmin = 1.6
            xmax = 2.0
            text = "sp"
        intervals [5]:
            xmin = 2.0
            xmax = 2.7
            text = "prince"
        intervals [6]:
            xmin = 2.7
            xmax = 3.0
            text = "#"
        intervals [7]:
            xmin = 3.0
            xmax = 4.2
            text = "said ""hello"""
        intervals [8]:
            xmin = 4.2
            xmax = 6.5
            text = ""
    item [2]:
        class = "TextTier"
        name = "events"
        xmin = 0
        xmax = 6.5
        points: size = 1
        points [1]:
            number = 3.5
            mark = "click"
"##;

    const SHORT_FORMAT: &str = r##"File type = "ooTextFile"
Object class = "TextGrid"

0
4
<exists>
1
"IntervalTier"
"words"
0
4
4
0
1
"hello"
1
2
"#"
2
3
"SIL"
3
4
"world"
"##;

    #[test]
    fn test_parse_long_format() {
        let grid = TextGrid::parse(LONG_FORMAT).unwrap();
        assert_eq!(grid.xmax, 6.5);
        assert_eq!(grid.tiers.len(), 2);
        assert_eq!(grid.tiers[0].name(), "words");
        assert_eq!(grid.tiers[1].name(), "events");

        let words = grid.first_interval_tier().unwrap();
        assert_eq!(words.len(), 8);
        assert_eq!(words[6].label, "said \"hello\"");
        assert_eq!(words[5].label, "#");
    }

    #[test]
    fn test_parse_without_spaces_around_equals() {
        let compact = LONG_FORMAT.replace(" = ", "=");
        let grid = TextGrid::parse(&compact).unwrap();
        assert_eq!(grid.xmin, 0.0);
        assert_eq!(grid.xmax, 6.5);
        let words = grid.first_interval_tier().unwrap();
        assert_eq!(words.len(), 8);
        assert_eq!(words[1].start, 0.5);
        assert_eq!(words[1].label, "the");
    }

    #[test]
    fn test_parse_short_format() {
        let grid = TextGrid::parse(SHORT_FORMAT).unwrap();
        let words = grid.first_interval_tier().unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(words[3].label, "world");
    }

    #[test]
    fn test_sentence_grouping() {
        let grid = TextGrid::parse(LONG_FORMAT).unwrap();
        let sentences =
            sentence_intervals(grid.first_interval_tier().unwrap(), &SentenceRules::default());

        // "the little prince" closed by #, trailing word closed at end of tier
        assert_eq!(
            sentences,
            vec![
                SentenceInterval::new(0.5, 2.7),
                SentenceInterval::new(3.0, 4.2)
            ]
        );
        assert!((sentences[0].duration() - 2.2).abs() < 1e-12);
    }

    #[test]
    fn test_silence_only_between_boundaries() {
        let grid = TextGrid::parse(SHORT_FORMAT).unwrap();
        let sentences =
            sentence_intervals(grid.first_interval_tier().unwrap(), &SentenceRules::default());
        assert_eq!(
            sentences,
            vec![SentenceInterval::new(0.0, 1.0), SentenceInterval::new(3.0, 4.0)]
        );
    }

    #[test]
    fn test_malformed_input() {
        assert!(TextGrid::parse("File type = \"ooTextFile\"\nObject class = \"Pitch\"").is_err());
        assert!(TextGrid::parse("File type = \"ooTextFile").is_err());
        assert!(TextGrid::parse(&SHORT_FORMAT.replace("\"world\"", "")).is_err());
    }

    #[test]
    fn test_utf16_decoding() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "ab\"c".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&bytes), "ab\"c");
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let outcome = load_sentence_intervals(
            Path::new("/nonexistent/lppEN_section1.TextGrid"),
            &SentenceRules::default(),
        );
        assert!(matches!(outcome, StageOutcome::Unavailable(_)));
    }
}
