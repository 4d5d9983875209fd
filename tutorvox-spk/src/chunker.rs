//! Text normalisation and chunking for the speech model
//!
//! The model handles a bounded amount of text per generation call. Long
//! input is split at sentence boundaries first, then at clause punctuation,
//! then between words. A single word longer than the limit is cut by
//! characters as a last resort.

/// Trim and collapse runs of whitespace into single spaces
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | '\n')
}

fn is_clause_end(c: char) -> bool {
    matches!(c, ',' | ':' | '-')
}

/// Split `text` on boundaries matched by `boundary`, keeping the boundary
/// character with the piece before it
fn split_keeping<F: Fn(char) -> bool>(text: &str, boundary: F) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if boundary(c) {
            let end = i + c.len_utf8();
            let piece = text[start..end].trim();
            if !piece.is_empty() {
                pieces.push(piece);
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Greedy packer: appends pieces to the current chunk while it stays under
/// `max_chars`
struct Packer {
    max_chars: usize,
    chunks: Vec<String>,
    current: String,
}

impl Packer {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            chunks: Vec::new(),
            current: String::new(),
        }
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.chunks.push(std::mem::take(&mut self.current));
        }
    }

    fn fits(&self, piece: &str) -> bool {
        let sep = usize::from(!self.current.is_empty());
        self.current.chars().count() + sep + piece.chars().count() <= self.max_chars
    }

    fn push(&mut self, piece: &str) {
        if !self.fits(piece) {
            self.flush();
        }
        if !self.current.is_empty() {
            self.current.push(' ');
        }
        self.current.push_str(piece);
    }

    fn push_hard(&mut self, word: &str) {
        self.flush();
        let chars: Vec<char> = word.chars().collect();
        for part in chars.chunks(self.max_chars) {
            self.chunks.push(part.iter().collect());
        }
    }
}

/// Split normalised text into chunks of at most `max_chars` characters
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let text = normalize(text);
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_chars {
        return vec![text];
    }

    let mut packer = Packer::new(max_chars);
    for sentence in split_keeping(&text, is_sentence_end) {
        if sentence.chars().count() <= max_chars {
            packer.push(sentence);
            continue;
        }
        for clause in split_keeping(sentence, is_clause_end) {
            if clause.chars().count() <= max_chars {
                packer.push(clause);
                continue;
            }
            for word in clause.split(' ') {
                if word.chars().count() <= max_chars {
                    packer.push(word);
                } else {
                    packer.push_hard(word);
                }
            }
        }
    }
    packer.flush();
    packer.chunks
}
