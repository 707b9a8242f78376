// File: src/errors.rs
//
// Diagnostic formatting for Ember. A compile-time error has one fixed wire
// format -- `[line L] Error at '<lexeme>': <message>` (or `at end`, or no
// location clause at all for a bare scanner error) -- which is what a test
// capturing stderr through a pipe sees. `colored` only decorates it for an
// interactive terminal; it never changes the plain text underneath.

use std::io::Write;

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLocation<'a> {
    AtEnd,
    At(&'a str),
    None,
}

pub fn format_compile_error(line: u32, location: ErrorLocation, message: &str) -> String {
    match location {
        ErrorLocation::AtEnd => format!("[line {line}] Error at end: {message}"),
        ErrorLocation::At(lexeme) => format!("[line {line}] Error at '{lexeme}': {message}"),
        ErrorLocation::None => format!("[line {line}] Error: {message}"),
    }
}

/// Writes one compile-error diagnostic to `out` -- the VM's error sink in
/// production (real stderr) or a capturing buffer in a test that wants to
/// assert the exact message.
pub fn write_compile_error(out: &mut dyn Write, line: u32, location: ErrorLocation, message: &str) {
    let _ = writeln!(out, "{}", colorize_error_prefix(&format_compile_error(line, location, message)));
}

fn colorize_error_prefix(plain: &str) -> String {
    match plain.find("Error") {
        Some(idx) => {
            let (head, tail) = plain.split_at(idx);
            let (word, rest) = tail.split_at("Error".len());
            format!("{head}{}{rest}", word.red().bold())
        }
        None => plain.to_string(),
    }
}

/// One frame of a runtime backtrace, innermost call first. `name` is the
/// function's name, or `"script"` for the outermost frame -- matches the
/// loop in the original `runtimeError`.
pub struct Frame {
    pub line: u32,
    pub name: String,
}

/// Prints a runtime error the way `runtimeError` does: the message first,
/// then one `[line L] in <name>` per active call frame, innermost first.
/// The `"SKILL ISSUE: "` prefix on `message` is not added here -- it is
/// Ember's established runtime-error voice and is baked into the message
/// text by whatever raised the error.
pub fn report_runtime_error(message: &str, frames: &[Frame]) {
    eprintln!("{}", message.red());
    for frame in frames {
        if frame.name == "script" {
            eprintln!("[line {}] in script", frame.line);
        } else {
            eprintln!("[line {}] in {}()", frame.line, frame.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_error_at_lexeme() {
        assert_eq!(
            format_compile_error(3, ErrorLocation::At("+"), "Expect expression."),
            "[line 3] Error at '+': Expect expression."
        );
    }

    #[test]
    fn formats_error_at_end() {
        assert_eq!(
            format_compile_error(10, ErrorLocation::AtEnd, "Expect '}' after block."),
            "[line 10] Error at end: Expect '}' after block."
        );
    }

    #[test]
    fn formats_bare_scanner_error() {
        assert_eq!(
            format_compile_error(1, ErrorLocation::None, "Unterminated string."),
            "[line 1] Error: Unterminated string."
        );
    }
}
