//! Property transforms attached to template entries.
//!
//! A template entry describes how a property value is post-processed before
//! it reaches an output: substring extraction, case folding, control
//! character policy, output escaping, and regex extraction. Regexes are
//! compiled once when the template is built; the extractor only borrows
//! them.

use regex::Regex;

/// Substring selection, applied before any other transform.
#[derive(Clone, Debug)]
pub enum Substring {
    /// Byte range `[from, to)`, clamped to the value.
    Chars { from: usize, to: usize },
    /// 1-based field by delimiter byte.
    Field { number: usize, delimiter: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseConversion {
    Lower,
    Upper,
}

/// What to do with control characters embedded in a value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ControlCharPolicy {
    #[default]
    Keep,
    Drop,
    Space,
    /// Replace with `#NNN` (decimal byte value).
    Escape,
}

/// Path sanitization for values used as file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathSanitize {
    /// Remove slashes outright.
    Drop,
    /// Replace slashes with `_`.
    Replace,
}

/// Behavior when a regex does not match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoMatchPolicy {
    #[default]
    Empty,
    /// The literal `**NO MATCH**`.
    NoMatchText,
    /// The literal `0`.
    Zero,
    /// Fall through to the whole field.
    WholeField,
}

#[derive(Clone, Debug)]
pub struct RegexExtract {
    pub regex: Regex,
    /// Which capture group to extract; 0 is the whole match.
    pub submatch: usize,
    pub no_match: NoMatchPolicy,
}

/// Literal emitted when a delimited field does not exist.
const FIELD_NOT_FOUND: &str = "***FIELD NOT FOUND***";

/// Literal emitted under [`NoMatchPolicy::NoMatchText`].
const NO_MATCH: &str = "**NO MATCH**";

/// One template entry's transform pipeline.
#[derive(Clone, Debug, Default)]
pub struct TemplateEntry {
    pub substring: Option<Substring>,
    pub regex: Option<RegexExtract>,
    pub case: Option<CaseConversion>,
    pub control_chars: ControlCharPolicy,
    pub path_sanitize: Option<PathSanitize>,
    pub drop_last_lf: bool,
    pub csv: bool,
    pub json_escape: bool,
}

impl TemplateEntry {
    /// Applies the transform pipeline to a property value.
    pub fn apply(&self, value: &str) -> String {
        let mut out: String;

        // Regex extraction takes precedence over positional substrings.
        if let Some(re) = &self.regex {
            out = match re.regex.captures(value) {
                Some(caps) => caps
                    .get(re.submatch)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                None => match re.no_match {
                    NoMatchPolicy::Empty => String::new(),
                    NoMatchPolicy::NoMatchText => NO_MATCH.to_string(),
                    NoMatchPolicy::Zero => "0".to_string(),
                    NoMatchPolicy::WholeField => value.to_string(),
                },
            };
        } else if let Some(sub) = &self.substring {
            out = match sub {
                Substring::Chars { from, to } => {
                    let from = (*from).min(value.len());
                    let to = (*to).min(value.len()).max(from);
                    value
                        .get(from..to)
                        .map(str::to_string)
                        .unwrap_or_default()
                }
                Substring::Field { number, delimiter } => value
                    .split(*delimiter as char)
                    .nth(number.saturating_sub(1))
                    .map(str::to_string)
                    .unwrap_or_else(|| FIELD_NOT_FOUND.to_string()),
            };
        } else {
            out = value.to_string();
        }

        if let Some(case) = self.case {
            out = match case {
                CaseConversion::Lower => out.to_lowercase(),
                CaseConversion::Upper => out.to_uppercase(),
            };
        }

        match self.control_chars {
            ControlCharPolicy::Keep => {}
            ControlCharPolicy::Drop => out.retain(|c| !c.is_control() || c == ' '),
            ControlCharPolicy::Space => {
                out = out.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
            }
            ControlCharPolicy::Escape => {
                let mut escaped = String::with_capacity(out.len());
                for c in out.chars() {
                    if c.is_control() {
                        escaped.push('#');
                        escaped.push_str(&(c as u32).to_string());
                    } else {
                        escaped.push(c);
                    }
                }
                out = escaped;
            }
        }

        if let Some(mode) = self.path_sanitize {
            out = sanitize_path(&out, mode);
        }

        if self.drop_last_lf && out.ends_with('\n') {
            out.pop();
        }

        if self.csv {
            let mut quoted = String::with_capacity(out.len() + 2);
            quoted.push('"');
            for c in out.chars() {
                if c == '"' {
                    quoted.push('"');
                }
                quoted.push(c);
            }
            quoted.push('"');
            out = quoted;
        } else if self.json_escape {
            let mut escaped = String::with_capacity(out.len());
            crate::json::escape_into(&mut escaped, &out);
            out = escaped;
        }

        out
    }
}

/// Makes a value safe for use as a file name component: slashes are
/// dropped or replaced, and the relative-directory names `.` and `..`
/// become `_`.
fn sanitize_path(value: &str, mode: PathSanitize) -> String {
    if value == "." || value == ".." {
        return "_".to_string();
    }
    match mode {
        PathSanitize::Drop => value.chars().filter(|&c| c != '/').collect(),
        PathSanitize::Replace => value
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_without_options() {
        let entry = TemplateEntry::default();
        assert_eq!(entry.apply("hello"), "hello");
    }

    #[test]
    fn char_range_substring() {
        let entry = TemplateEntry {
            substring: Some(Substring::Chars { from: 2, to: 5 }),
            ..Default::default()
        };
        assert_eq!(entry.apply("abcdefgh"), "cde");
        assert_eq!(entry.apply("ab"), "");
    }

    #[test]
    fn delimited_field_extraction() {
        let entry = TemplateEntry {
            substring: Some(Substring::Field {
                number: 3,
                delimiter: b',',
            }),
            ..Default::default()
        };
        assert_eq!(entry.apply("a,b,c,d"), "c");
        assert_eq!(entry.apply("a,b"), "***FIELD NOT FOUND***");
    }

    #[test]
    fn case_conversion() {
        let entry = TemplateEntry {
            case: Some(CaseConversion::Upper),
            ..Default::default()
        };
        assert_eq!(entry.apply("MiXeD"), "MIXED");
    }

    #[test]
    fn control_char_policies() {
        let drop = TemplateEntry {
            control_chars: ControlCharPolicy::Drop,
            ..Default::default()
        };
        assert_eq!(drop.apply("a\tb\nc"), "abc");

        let space = TemplateEntry {
            control_chars: ControlCharPolicy::Space,
            ..Default::default()
        };
        assert_eq!(space.apply("a\tb"), "a b");

        let escape = TemplateEntry {
            control_chars: ControlCharPolicy::Escape,
            ..Default::default()
        };
        assert_eq!(escape.apply("a\tb"), "a#9b");
    }

    #[test]
    fn regex_extraction_with_policies() {
        let entry = TemplateEntry {
            regex: Some(RegexExtract {
                regex: Regex::new(r"pid=(\d+)").unwrap(),
                submatch: 1,
                no_match: NoMatchPolicy::NoMatchText,
            }),
            ..Default::default()
        };
        assert_eq!(entry.apply("x pid=412 y"), "412");
        assert_eq!(entry.apply("no pid here"), "**NO MATCH**");

        let whole = TemplateEntry {
            regex: Some(RegexExtract {
                regex: Regex::new(r"nope").unwrap(),
                submatch: 0,
                no_match: NoMatchPolicy::WholeField,
            }),
            ..Default::default()
        };
        assert_eq!(whole.apply("fallback"), "fallback");
    }

    #[test]
    fn csv_quoting() {
        let entry = TemplateEntry {
            csv: true,
            ..Default::default()
        };
        assert_eq!(entry.apply(r#"say "hi", ok"#), r#""say ""hi"", ok""#);
    }

    #[test]
    fn path_sanitization() {
        let drop = TemplateEntry {
            path_sanitize: Some(PathSanitize::Drop),
            ..Default::default()
        };
        assert_eq!(drop.apply("../etc/passwd"), "..etcpasswd");
        assert_eq!(drop.apply(".."), "_");

        let replace = TemplateEntry {
            path_sanitize: Some(PathSanitize::Replace),
            ..Default::default()
        };
        assert_eq!(replace.apply("a/b"), "a_b");
    }

    #[test]
    fn drop_last_lf_only_strips_one() {
        let entry = TemplateEntry {
            drop_last_lf: true,
            ..Default::default()
        };
        assert_eq!(entry.apply("line\n"), "line");
        assert_eq!(entry.apply("line\n\n"), "line\n");
        assert_eq!(entry.apply("line"), "line");
    }
}
