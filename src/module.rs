// File: src/module.rs
//
// Resolves and loads `import NAME;` targets. Mirrors `loadFile` in the
// original compiler: an import name is a bare identifier, never a path --
// `resolve` tries `./stl/<name>.mbr` first, falling back to `./<name>.mbr`
// in the current directory, and `read_normalized` replaces every line
// ending in the source with a single space before it ever reaches the
// lexer, matching the original's char-by-char read loop.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn resolve(name: &str) -> Option<PathBuf> {
    let stl_path = PathBuf::from("./stl").join(format!("{name}.mbr"));
    if stl_path.is_file() {
        return Some(stl_path);
    }

    let local_path = PathBuf::from(format!("{name}.mbr"));
    if local_path.is_file() {
        return Some(local_path);
    }

    None
}

/// Reads `path` and replaces every `\n`/`\r` with a space, matching the
/// byte-for-byte behavior of the original `loadFile`'s read loop.
pub fn read_normalized(path: &Path) -> io::Result<String> {
    let raw = fs::read_to_string(path)?;
    Ok(raw.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_newlines_to_spaces() {
        let dir = std::env::temp_dir().join(format!("ember-module-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sample.mbr");
        fs::write(&file, "var x = 1;\r\nvar y = 2;\n").unwrap();

        let normalized = read_normalized(&file).unwrap();
        assert_eq!(normalized, "var x = 1;  var y = 2; ");

        fs::remove_file(&file).unwrap();
        fs::remove_dir(&dir).unwrap();
    }

    #[test]
    fn resolve_returns_none_for_missing_import() {
        assert!(resolve("definitely-does-not-exist-anywhere").is_none());
    }
}
