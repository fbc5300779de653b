//! Patch patterns in JS regex syntax, on a backtracking engine.
//!
//! `fancy-regex` handles look-around and backreferences. Two JS habits need
//! help on top of it: a bare `{` or `}` outside a quantifier is a literal,
//! and a leading `(?<=..)` may have a variable length. The latter is matched
//! as a consumed prefix whose span is then cut off the match, with capture
//! groups renumbered as written.

use fancy_regex::Regex;
use std::fmt;
use std::ops::Index;

#[derive(Clone)]
pub struct Matcher {
    pattern: String,
    regex: Regex,
    /// Group that holds the real match when a leading look-behind was
    /// compiled as a prefix.
    prefix_split: Option<usize>,
}

impl Matcher {
    pub fn new(pattern: &str) -> Result<Self, fancy_regex::Error> {
        let translated = escape_lone_braces(pattern);
        let err = match Regex::new(&translated) {
            Ok(regex) => {
                return Ok(Self {
                    pattern: pattern.to_string(),
                    regex,
                    prefix_split: None,
                })
            }
            Err(err) => err,
        };

        let Some((behind, rest)) = split_leading_lookbehind(&translated) else {
            return Err(err);
        };
        let groups_behind = Regex::new(&format!("(?:{behind})"))?.captures_len() - 1;
        let regex = Regex::new(&format!("(?:{behind})({rest})"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            prefix_split: Some(groups_behind + 1),
        })
    }

    /// Match `text` verbatim.
    pub fn literal(text: &str) -> Result<Self, fancy_regex::Error> {
        Ok(Self {
            pattern: text.to_string(),
            regex: Regex::new(&regex::escape(text))?,
            prefix_split: None,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Up to `limit` non-overlapping matches, leftmost first.
    pub fn captures<'t>(
        &self,
        text: &'t str,
        limit: usize,
    ) -> Result<Vec<Captures<'t>>, fancy_regex::Error> {
        let mut out = Vec::new();
        for caps in self.regex.captures_iter(text) {
            if out.len() >= limit {
                break;
            }
            let caps = caps?;
            let mut groups: Vec<Option<(usize, usize)>> = (0..caps.len())
                .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                .collect();
            if let Some(split) = self.prefix_split {
                let whole = match (groups.get(split).copied().flatten(), groups[0]) {
                    (Some((start, _)), Some((_, end))) => Some((start, end)),
                    _ => continue,
                };
                groups.remove(split);
                groups[0] = whole;
            }
            out.push(Captures { text, groups });
        }
        Ok(out)
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Matcher").field(&self.pattern).finish()
    }
}

/// One match and its capture groups. Group 0 is the whole match.
#[derive(Debug, Clone)]
pub struct Captures<'t> {
    text: &'t str,
    groups: Vec<Option<(usize, usize)>>,
}

impl<'t> Captures<'t> {
    pub fn get(&self, i: usize) -> Option<&'t str> {
        let (start, end) = self.groups.get(i).copied().flatten()?;
        Some(&self.text[start..end])
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn span(&self) -> (usize, usize) {
        self.groups[0].unwrap_or((0, 0))
    }

    /// Append `template` with JS replacement syntax expanded: `$$`, `$&`,
    /// `` $` ``, `$'`, `$1`..`$99`. Anything else is copied as is.
    pub fn expand(&self, template: &str, out: &mut String) {
        let (start, end) = self.span();
        let bytes = template.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let Some(offset) = template[i..].find('$') else {
                out.push_str(&template[i..]);
                break;
            };
            out.push_str(&template[i..i + offset]);
            i += offset;

            match bytes.get(i + 1) {
                Some(b'$') => {
                    out.push('$');
                    i += 2;
                }
                Some(b'&') => {
                    out.push_str(&self.text[start..end]);
                    i += 2;
                }
                Some(b'`') => {
                    out.push_str(&self.text[..start]);
                    i += 2;
                }
                Some(b'\'') => {
                    out.push_str(&self.text[end..]);
                    i += 2;
                }
                Some(d) if d.is_ascii_digit() => {
                    let one = usize::from(d - b'0');
                    let two = bytes
                        .get(i + 2)
                        .filter(|d| d.is_ascii_digit())
                        .map(|d2| one * 10 + usize::from(d2 - b'0'));
                    match two {
                        Some(n) if n > 0 && n < self.len() => {
                            out.push_str(self.get(n).unwrap_or(""));
                            i += 3;
                        }
                        _ if one > 0 && one < self.len() => {
                            out.push_str(self.get(one).unwrap_or(""));
                            i += 2;
                        }
                        _ => {
                            out.push('$');
                            i += 1;
                        }
                    }
                }
                _ => {
                    out.push('$');
                    i += 1;
                }
            }
        }
    }
}

impl Index<usize> for Captures<'_> {
    type Output = str;

    fn index(&self, i: usize) -> &str {
        match self.get(i) {
            Some(text) => text,
            None => panic!("no group at index {i}"),
        }
    }
}

/// `(?<=X)Y` -> `(X, Y)`, when the pattern starts with a positive
/// look-behind.
fn split_leading_lookbehind(pattern: &str) -> Option<(&str, &str)> {
    let body = pattern.strip_prefix("(?<=")?;
    let mut depth = 1;
    let mut in_class = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => depth += 1,
            ')' if !in_class => {
                depth -= 1;
                if depth == 0 {
                    return Some((&body[..i], &body[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn escape_lone_braces(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len());
    let mut in_class = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                out.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
                continue;
            }
            '[' => in_class = true,
            ']' => in_class = false,
            '{' if !in_class => {
                if let Some(len) = quantifier_len(&chars[i..]) {
                    out.extend(&chars[i..i + len]);
                    i += len;
                    continue;
                }
                out.push_str("\\{");
                i += 1;
                continue;
            }
            '}' if !in_class => {
                out.push_str("\\}");
                i += 1;
                continue;
            }
            _ => {}
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Length of a `{n}`, `{n,}` or `{n,m}` quantifier at the start of `rest`.
fn quantifier_len(rest: &[char]) -> Option<usize> {
    let close = rest.iter().position(|&c| c == '}')?;
    let body: String = rest[1..close].iter().collect();
    let (min, max) = match body.split_once(',') {
        Some((min, max)) => (min, Some(max)),
        None => (body.as_str(), None),
    };
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    let valid = !min.is_empty() && digits(min) && max.map_or(true, digits);
    valid.then_some(close + 1)
}
