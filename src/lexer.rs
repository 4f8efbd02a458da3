//! Lexical analysis for command lines: quoting-aware splitting into words
//! and the structural operators `|`, `<`, `>` and `>>`.

/// A token produced by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A word: command name, argument, or redirection target.
    ///
    /// `quoted` is true when any part of the word came from inside quotes;
    /// that is how an intentionally-empty argument (`''` or `""`) survives
    /// tokenization instead of vanishing.
    Word { text: String, quoted: bool },
    /// The pipe operator, `|`.
    Pipe,
    /// Input redirection, `<`.
    RedirIn,
    /// Output redirection (truncate), `>`.
    RedirOut,
    /// Output redirection (append), `>>`.
    RedirAppend,
}

/// Which quote was left open when the input ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenQuote {
    Single,
    Double,
}

/// Result of scanning one (possibly multi-line) command line.
#[derive(Debug, PartialEq, Eq)]
pub enum LexOutcome {
    Done(Vec<Token>),
    /// The line ended inside a quote. The caller must append the next input
    /// line, keeping the newline as a literal character, and rescan.
    Incomplete(OpenQuote),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    SingleQuote,
    DoubleQuote,
}

/// Scanner over an immutable copy of the input. Word buffers grow by
/// append; there is no fixed per-token or per-line capacity.
struct Scanner {
    chars: Vec<char>,
    pos: usize,
    state: LexState,
    buf: String,
    in_word: bool,
    quoted: bool,
    tokens: Vec<Token>,
}

impl Scanner {
    fn new(line: &str) -> Self {
        Scanner {
            chars: line.chars().collect(),
            pos: 0,
            state: LexState::Normal,
            buf: String::new(),
            in_word: false,
            quoted: false,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> LexOutcome {
        while let Some(ch) = self.read_char() {
            match self.state {
                LexState::Normal => self.handle_normal(ch),
                LexState::SingleQuote => self.handle_quote(ch, '\'', LexState::Normal),
                LexState::DoubleQuote => self.handle_quote(ch, '"', LexState::Normal),
            }
        }

        match self.state {
            LexState::SingleQuote => LexOutcome::Incomplete(OpenQuote::Single),
            LexState::DoubleQuote => LexOutcome::Incomplete(OpenQuote::Double),
            LexState::Normal => {
                self.flush_word();
                LexOutcome::Done(self.tokens)
            }
        }
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn handle_normal(&mut self, ch: char) {
        match ch {
            // unquoted newlines only occur when continuation lines were
            // joined; they delimit like any other whitespace
            ' ' | '\t' | '\n' | '\r' => self.flush_word(),
            '|' => {
                self.flush_word();
                self.tokens.push(Token::Pipe);
            }
            '<' => {
                self.flush_word();
                self.tokens.push(Token::RedirIn);
            }
            '>' => {
                self.flush_word();
                if self.peek_char() == Some('>') {
                    self.read_char();
                    self.tokens.push(Token::RedirAppend);
                } else {
                    self.tokens.push(Token::RedirOut);
                }
            }
            '\'' => {
                self.in_word = true;
                self.quoted = true;
                self.state = LexState::SingleQuote;
            }
            '"' => {
                self.in_word = true;
                self.quoted = true;
                self.state = LexState::DoubleQuote;
            }
            c => {
                self.in_word = true;
                self.buf.push(c);
            }
        }
    }

    fn handle_quote(&mut self, ch: char, closer: char, next: LexState) {
        if ch == closer {
            self.state = next;
        } else {
            self.buf.push(ch);
        }
    }

    fn flush_word(&mut self) {
        if self.in_word {
            self.tokens.push(Token::Word {
                text: std::mem::take(&mut self.buf),
                quoted: self.quoted,
            });
            self.in_word = false;
            self.quoted = false;
        }
    }
}

/// Scans one command line into tokens, or reports an open quote.
pub fn scan(line: &str) -> LexOutcome {
    Scanner::new(line).run()
}

/// Strips a trailing background marker.
///
/// `&` is recognized only at the very end of the line (after trailing
/// whitespace); everywhere else it is an ordinary word character. The check
/// runs before scanning, so the caller must discard its result when the scan
/// ends in a continuation (the `&` might sit inside an open quote).
pub fn strip_background(line: &str) -> (&str, bool) {
    let trimmed = line.trim_end();
    match trimmed.strip_suffix('&') {
        Some(rest) => (rest, true),
        None => (line, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(outcome: LexOutcome) -> Vec<String> {
        match outcome {
            LexOutcome::Done(tokens) => tokens
                .into_iter()
                .map(|t| match t {
                    Token::Word { text, .. } => text,
                    Token::Pipe => "|".to_string(),
                    Token::RedirIn => "<".to_string(),
                    Token::RedirOut => ">".to_string(),
                    Token::RedirAppend => ">>".to_string(),
                })
                .collect(),
            LexOutcome::Incomplete(q) => panic!("unexpected continuation: {q:?}"),
        }
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(words(scan("echo  hello\tworld")), ["echo", "hello", "world"]);
    }

    #[test]
    fn word_accumulates_across_quote_boundaries() {
        assert_eq!(words(scan("ab'cd'ef")), ["abcdef"]);
        assert_eq!(words(scan(r#"a"b c"d"#)), ["ab cd"]);
    }

    #[test]
    fn quotes_preserve_spaces_and_operators() {
        assert_eq!(words(scan("echo 'a b' \"c d\" e")), ["echo", "a b", "c d", "e"]);
        assert_eq!(words(scan("echo 'a|b<c>d'")), ["echo", "a|b<c>d"]);
    }

    #[test]
    fn operators_delimit_without_whitespace() {
        assert_eq!(words(scan("a|b")), ["a", "|", "b"]);
        assert_eq!(words(scan("sort<in>out")), ["sort", "<", "in", ">", "out"]);
        assert_eq!(words(scan("log>>file")), ["log", ">>", "file"]);
    }

    #[test]
    fn empty_quoted_word_survives() {
        let LexOutcome::Done(tokens) = scan("''") else {
            panic!("expected tokens");
        };
        assert_eq!(
            tokens,
            vec![Token::Word {
                text: String::new(),
                quoted: true
            }]
        );
    }

    #[test]
    fn open_quote_is_incomplete() {
        assert_eq!(scan("echo 'abc"), LexOutcome::Incomplete(OpenQuote::Single));
        assert_eq!(scan("echo \"abc"), LexOutcome::Incomplete(OpenQuote::Double));
    }

    #[test]
    fn quoted_newline_is_literal() {
        assert_eq!(words(scan("echo 'a\nb'")), ["echo", "a\nb"]);
    }

    #[test]
    fn trailing_ampersand_is_stripped() {
        assert_eq!(strip_background("sleep 1 &"), ("sleep 1 ", true));
        assert_eq!(strip_background("sleep 1&  "), ("sleep 1", true));
        assert_eq!(strip_background("echo a"), ("echo a", false));
        // not trailing: ordinary word character
        assert_eq!(strip_background("a&b"), ("a&b", false));
    }
}
