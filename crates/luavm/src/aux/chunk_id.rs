// Compress a source identifier into a fixed-length chunk id for error
// messages: '@file' is a file name (truncated from the front), '=name'
// is used verbatim (truncated from the back), anything else is a source
// literal quoted as [string "..."] with its first line.

use smol_str::SmolStr;

use crate::lua_vm::limits::ID_SIZE;

pub fn chunk_id(source: &str) -> SmolStr {
    match source.as_bytes().first() {
        Some(b'=') => {
            let body = &source[1..];
            if body.len() <= ID_SIZE {
                SmolStr::new(body)
            } else {
                SmolStr::new(&body[..ID_SIZE])
            }
        }
        Some(b'@') => {
            let body = &source[1..];
            if body.len() <= ID_SIZE {
                SmolStr::new(body)
            } else {
                let keep = ID_SIZE - 3;
                SmolStr::new(format!("...{}", &body[body.len() - keep..]))
            }
        }
        _ => {
            let first_line = source.lines().next().unwrap_or("");
            let truncated = first_line.len() < source.len();
            let max = ID_SIZE.saturating_sub(16);
            if first_line.len() <= max && !truncated {
                SmolStr::new(format!("[string \"{}\"]", first_line))
            } else {
                let cut = &first_line[..first_line.len().min(max)];
                SmolStr::new(format!("[string \"{}...\"]", cut))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_chunks_pass_through() {
        assert_eq!(chunk_id("=stdin").as_str(), "stdin");
    }

    #[test]
    fn file_names_truncate_from_the_front() {
        assert_eq!(chunk_id("@init.lua").as_str(), "init.lua");
        let long = format!("@{}", "d/".repeat(50));
        let id = chunk_id(&long);
        assert!(id.len() <= ID_SIZE);
        assert!(id.starts_with("..."));
    }

    #[test]
    fn literals_are_quoted() {
        assert_eq!(
            chunk_id("return 1").as_str(),
            "[string \"return 1\"]"
        );
        let id = chunk_id("local x = 1\nreturn x");
        assert!(id.starts_with("[string \"local x = 1"));
        assert!(id.ends_with("...\"]"));
    }
}
