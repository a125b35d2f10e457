// src/gcode/parser.rs - Word scanner and block assembly
//! Splits one line into letter/number words, tracking where each word came
//! from so errors can point at the offending column.

use crate::{AXES, Axis, LINE_BUFFER_LEN};
use std::ops::Range;
use thiserror::Error;

/// Span in the original line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GCodeSpan {
    pub range: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GCodeError {
    #[error("bad number for word '{letter}' at column {}", .span.range.start)]
    BadNumber { letter: char, span: GCodeSpan },
    #[error("unexpected character '{ch}' at column {}", .span.range.start)]
    UnexpectedCharacter { ch: char, span: GCodeSpan },
    #[error("unclosed comment starting at column {}", .span.range.start)]
    UnclosedComment { span: GCodeSpan },
    #[error("unsupported word '{letter}' at column {}", .span.range.start)]
    UnsupportedWord { letter: char, span: GCodeSpan },
    #[error("word '{letter}' repeated at column {}", .span.range.start)]
    RepeatedWord { letter: char, span: GCodeSpan },
    #[error("unsupported code {letter}{value}")]
    UnsupportedCode { letter: char, value: f64 },
    #[error("too many {0} codes in one block")]
    TooManyCodes(char),
    #[error("line longer than {} bytes", LINE_BUFFER_LEN)]
    LineTooLong,
}

/// One letter/number pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub letter: char,
    pub value: f64,
    pub span: GCodeSpan,
}

/// Scanner over the words of a single line. Comments in parentheses and
/// everything after `;` are skipped.
pub struct WordScanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> WordScanner<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub fn next_word(&mut self) -> Option<Result<Word, GCodeError>> {
        let bytes = self.src.as_bytes();
        let len = bytes.len();
        loop {
            while self.pos < len && bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos >= len {
                return None;
            }
            let start = self.pos;
            let c = bytes[self.pos];
            match c {
                b';' => {
                    self.pos = len;
                    return None;
                }
                b'(' => match bytes[start..].iter().position(|&b| b == b')') {
                    Some(close) => self.pos = start + close + 1,
                    None => {
                        self.pos = len;
                        return Some(Err(GCodeError::UnclosedComment {
                            span: GCodeSpan { range: start..len },
                        }));
                    }
                },
                c if c.is_ascii_alphabetic() => {
                    let letter = (c as char).to_ascii_uppercase();
                    self.pos += 1;
                    while self.pos < len && bytes[self.pos] == b' ' {
                        self.pos += 1;
                    }
                    let value_start = self.pos;
                    while self.pos < len
                        && (bytes[self.pos].is_ascii_digit() || matches!(bytes[self.pos], b'.' | b'-' | b'+'))
                    {
                        self.pos += 1;
                    }
                    let span = GCodeSpan { range: start..self.pos };
                    let text = &self.src[value_start..self.pos];
                    return Some(match text.parse::<f64>() {
                        Ok(value) if value.is_finite() => Ok(Word { letter, value, span }),
                        _ => Err(GCodeError::BadNumber { letter, span }),
                    });
                }
                _ => {
                    let ch = self.src[start..].chars().next().unwrap_or('?');
                    self.pos = len;
                    return Some(Err(GCodeError::UnexpectedCharacter {
                        ch,
                        span: GCodeSpan { range: start..start + ch.len_utf8() },
                    }));
                }
            }
        }
    }
}

impl Iterator for WordScanner<'_> {
    type Item = Result<Word, GCodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_word()
    }
}

/// Words of one line, grouped by meaning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    /// G codes in tenths: `G28.2` is 282, `G1` is 10.
    pub g: heapless::Vec<u16, 8>,
    pub m: heapless::Vec<u8, 4>,
    pub axes: [Option<f64>; AXES],
    /// I, J, K.
    pub offsets: [Option<f64>; 3],
    pub r: Option<f64>,
    pub f: Option<f64>,
    pub s: Option<f64>,
    pub t: Option<f64>,
    pub p: Option<f64>,
    pub l: Option<f64>,
    pub n: Option<u32>,
}

impl Block {
    pub fn has_axis_words(&self) -> bool {
        self.axes.iter().any(Option::is_some)
    }

    /// No words at all (blank line, comment, or deleted block).
    pub fn is_empty(&self) -> bool {
        *self == Block::default()
    }
}

fn set_once(slot: &mut Option<f64>, word: &Word) -> Result<(), GCodeError> {
    if slot.is_some() {
        return Err(GCodeError::RepeatedWord { letter: word.letter, span: word.span.clone() });
    }
    *slot = Some(word.value);
    Ok(())
}

/// Parse one line into a [`Block`]. A line starting with `/` is deleted and
/// yields an empty block.
pub fn parse_block(line: &str) -> Result<Block, GCodeError> {
    if line.len() > LINE_BUFFER_LEN {
        return Err(GCodeError::LineTooLong);
    }
    let mut block = Block::default();
    if line.trim_start().starts_with('/') {
        return Ok(block);
    }
    for word in WordScanner::new(line) {
        let word = word?;
        match word.letter {
            'G' => {
                let tenths = (word.value * 10.0).round();
                if word.value < 0.0 || (tenths - word.value * 10.0).abs() > 1e-6 || tenths > f64::from(u16::MAX) {
                    return Err(GCodeError::UnsupportedCode { letter: 'G', value: word.value });
                }
                block.g.push(tenths as u16).map_err(|_| GCodeError::TooManyCodes('G'))?;
            }
            'M' => {
                if word.value < 0.0 || word.value.fract() != 0.0 || word.value > 255.0 {
                    return Err(GCodeError::UnsupportedCode { letter: 'M', value: word.value });
                }
                block.m.push(word.value as u8).map_err(|_| GCodeError::TooManyCodes('M'))?;
            }
            'I' => set_once(&mut block.offsets[0], &word)?,
            'J' => set_once(&mut block.offsets[1], &word)?,
            'K' => set_once(&mut block.offsets[2], &word)?,
            'R' => set_once(&mut block.r, &word)?,
            'F' => set_once(&mut block.f, &word)?,
            'S' => set_once(&mut block.s, &word)?,
            'T' => set_once(&mut block.t, &word)?,
            'P' => set_once(&mut block.p, &word)?,
            'L' => set_once(&mut block.l, &word)?,
            'N' => {
                if block.n.is_some() {
                    return Err(GCodeError::RepeatedWord { letter: 'N', span: word.span });
                }
                if word.value < 0.0 || word.value.fract() != 0.0 {
                    return Err(GCodeError::BadNumber { letter: 'N', span: word.span });
                }
                block.n = Some(word.value as u32);
            }
            letter => match Axis::from_letter(letter) {
                Some(axis) => set_once(&mut block.axes[axis.index()], &word)?,
                None => {
                    return Err(GCodeError::UnsupportedWord { letter, span: word.span });
                }
            },
        }
    }
    Ok(block)
}
