// src/gcode/mod.rs - Reference block parser feeding the canonical machine
pub mod interp;
pub mod parser;

pub use interp::{CommandQueue, interpret};
pub use parser::{Block, GCodeError, GCodeSpan, Word, WordScanner, parse_block};

use crate::error::MotionError;

impl From<GCodeError> for MotionError {
    fn from(err: GCodeError) -> Self {
        match err {
            GCodeError::BadNumber { .. } | GCodeError::UnclosedComment { .. } | GCodeError::LineTooLong => {
                MotionError::BadNumber
            }
            GCodeError::UnexpectedCharacter { .. }
            | GCodeError::UnsupportedWord { .. }
            | GCodeError::RepeatedWord { .. }
            | GCodeError::UnsupportedCode { .. }
            | GCodeError::TooManyCodes(_) => MotionError::UnsupportedCommand,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_errors_map_to_status_kinds() {
        let bad = parse_block("G1 X1..").unwrap_err();
        assert_eq!(MotionError::from(bad), MotionError::BadNumber);
        let unsupported = parse_block("G1 Q4").unwrap_err();
        assert_eq!(MotionError::from(unsupported), MotionError::UnsupportedCommand);
    }
}
