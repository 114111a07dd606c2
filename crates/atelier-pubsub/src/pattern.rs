//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Anchored wildcard matching for pattern subscriptions."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::fmt;

/// Characters with special meaning in broker glob syntax.
const GLOB_SPECIALS: [char; 5] = ['*', '?', '[', ']', '\\'];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnySequence,
    AnyOne,
}

/// Compiled channel pattern.
///
/// Application patterns treat `*` as the only wildcard; it matches any run of
/// characters (including none) and the pattern is anchored at both ends, so
/// `canvas:*` matches `canvas:` and `canvas:abc` but not `canvasX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl ChannelPattern {
    /// Compile an application pattern.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let tokens = raw
            .chars()
            .map(|ch| match ch {
                '*' => Token::AnySequence,
                other => Token::Literal(other),
            })
            .collect();
        Self { raw, tokens }
    }

    /// Compile a broker-dialect glob where `?` matches one character and `\`
    /// escapes the next one.
    pub fn from_glob(glob: impl Into<String>) -> Self {
        let raw = glob.into();
        let mut tokens = Vec::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(ch) = chars.next() {
            tokens.push(match ch {
                '*' => Token::AnySequence,
                '?' => Token::AnyOne,
                '\\' => Token::Literal(chars.next().unwrap_or('\\')),
                other => Token::Literal(other),
            });
        }
        Self { raw, tokens }
    }

    /// Source text the pattern was compiled from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Render as a broker glob matching exactly the same channels.
    pub fn to_glob(&self) -> String {
        let mut glob = String::with_capacity(self.raw.len());
        for token in &self.tokens {
            match token {
                Token::AnySequence => glob.push('*'),
                Token::AnyOne => glob.push('?'),
                Token::Literal(ch) => push_escaped(&mut glob, *ch),
            }
        }
        glob
    }

    /// Whether the whole `channel` matches.
    pub fn matches(&self, channel: &str) -> bool {
        let text: Vec<char> = channel.chars().collect();
        let mut t = 0;
        let mut p = 0;
        // (token index of the last `*`, text index it currently absorbs up to)
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.tokens.get(p) {
                Some(Token::AnySequence) => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                Some(Token::AnyOne) => {
                    p += 1;
                    t += 1;
                    continue;
                }
                Some(Token::Literal(ch)) if *ch == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
            match backtrack {
                Some((star, absorbed)) => {
                    p = star + 1;
                    t = absorbed + 1;
                    backtrack = Some((star, absorbed + 1));
                }
                None => return false,
            }
        }

        self.tokens[p..]
            .iter()
            .all(|token| matches!(token, Token::AnySequence))
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Escape `literal` so a broker glob matches it verbatim.
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        push_escaped(&mut escaped, ch);
    }
    escaped
}

fn push_escaped(out: &mut String, ch: char) {
    if GLOB_SPECIALS.contains(&ch) {
        out.push('\\');
    }
    out.push(ch);
}
