use std::fmt;

/// Glob pattern over channel names: `*` matches any run of characters,
/// `?` matches exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    chars: Vec<char>,
}

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let chars = raw.chars().collect();
        Self { raw, chars }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, channel: &str) -> bool {
        let text: Vec<char> = channel.chars().collect();
        let (mut p, mut t) = (0usize, 0usize);
        // Position of the last `*` seen and the text index it was tried at.
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.chars.get(p) {
                Some('*') => {
                    star = Some((p, t));
                    p += 1;
                }
                Some(&c) if c == '?' || c == text[t] => {
                    p += 1;
                    t += 1;
                }
                _ => match star {
                    Some((sp, st)) => {
                        p = sp + 1;
                        t = st + 1;
                        star = Some((sp, st + 1));
                    }
                    None => return false,
                },
            }
        }
        self.chars[p..].iter().all(|&c| c == '*')
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
