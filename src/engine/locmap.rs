use crate::engine::error::Error;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Name of the generated instrumentation file inside the PHP extension
/// directory. All native breakpoints are placed into this file.
pub const GENERATED_FILE: &str = "retrograde_break.c";

/// Line of `retrograde_break.c` hit exactly once per executed PHP statement.
/// Must match the emitter in the extension generator.
pub const STEP_SENTINEL_LINE: u32 = 94;

/// Line of `retrograde_break.c` reached once, right after the entry script
/// filename is captured. Used for the temporary start-up breakpoint.
pub const INIT_SENTINEL_LINE: u32 = 90;

const NUM_FILES_SENTINEL: &str = "//&&& Number of Files:";
const MAX_STACK_DEPTH_SENTINEL: &str = "//&&& Max Stack Depth:";
const SOURCE_SENTINEL: &str = "//###";
const LEVEL_SENTINEL: &str = "//$$$";

/// Break locations recovered from the generated instrumentation file.
///
/// `source_map` associates each recorded PHP source (as a `file://` URL) with
/// the line of the generated C file on which a breakpoint stops execution in
/// that source. `level_map` holds one generated-C line per stack depth.
/// Both are frozen once loaded.
#[derive(Debug, Clone)]
pub struct LocationMap {
    source_map: HashMap<String, u32>,
    level_map: Vec<u32>,
    max_stack_depth: usize,
}

impl LocationMap {
    pub fn load(extension_dir: &Path) -> Result<Self, Error> {
        let path = extension_dir.join(GENERATED_FILE);
        log::debug!(target: "engine", "looking for {}", path.display());
        let text = fs::read_to_string(&path)?;
        Self::parse(&text)
    }

    /// Parse the generated C text. Line numbers are 1-based, sentinels are
    /// found by substring search so they may share a line with real code.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut lines = text.lines();

        let first = lines
            .next()
            .ok_or_else(|| Error::InstrumentationMalformed("file is empty".into()))?;
        let num_files = sentinel_count(first, NUM_FILES_SENTINEL)?;

        let second = lines.next().ok_or_else(|| {
            Error::InstrumentationMalformed("missing max stack depth line".into())
        })?;
        let max_stack_depth = sentinel_count(second, MAX_STACK_DEPTH_SENTINEL)?;

        let mut source_map = HashMap::with_capacity(num_files);
        let mut level_map = Vec::with_capacity(max_stack_depth);

        let mut lineno = 2u32;
        for line in lines {
            lineno += 1;

            if let Some(at) = line.find(SOURCE_SENTINEL) {
                let path = line[at + SOURCE_SENTINEL.len()..].trim();
                let url = format!("file://{path}");
                if source_map.insert(url.clone(), lineno).is_some() {
                    return Err(Error::DuplicateMapping(url));
                }
            }

            if line.contains(LEVEL_SENTINEL) {
                if level_map.len() == max_stack_depth {
                    return Err(Error::InstrumentationMalformed(format!(
                        "more than {max_stack_depth} level sentinels"
                    )));
                }
                level_map.push(lineno);
            }
        }

        if source_map.len() != num_files {
            return Err(Error::InstrumentationMalformed(format!(
                "file declares {num_files} sources but {} were found",
                source_map.len()
            )));
        }
        if level_map.len() != max_stack_depth {
            return Err(Error::InstrumentationMalformed(format!(
                "file declares stack depth {max_stack_depth} but {} level sentinels were found",
                level_map.len()
            )));
        }

        Ok(LocationMap {
            source_map,
            level_map,
            max_stack_depth,
        })
    }

    /// Generated-C line carrying the break location for a PHP source URL.
    pub fn break_line_for(&self, file_url: &str) -> Option<u32> {
        self.source_map.get(file_url).copied()
    }

    /// Generated-C line for a stack depth, `0..max_stack_depth`.
    pub fn level_line(&self, depth: usize) -> Option<u32> {
        self.level_map.get(depth).copied()
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    pub fn file_count(&self) -> usize {
        self.source_map.len()
    }
}

fn sentinel_count(line: &str, sentinel: &str) -> Result<usize, Error> {
    let at = line
        .find(sentinel)
        .ok_or_else(|| Error::InstrumentationMalformed(format!("sentinel `{sentinel}` not found")))?;
    line[at + sentinel.len()..]
        .trim()
        .parse()
        .map_err(|_| Error::InstrumentationMalformed(format!("bad count after `{sentinel}`")))
}

#[cfg(test)]
mod test {
    use super::*;

    /// Build a synthetic generated file with sentinels at the given 1-based lines.
    fn generated(total: u32, sources: &[(&str, u32)], levels: &[u32], n: usize, d: usize) -> String {
        let mut out = format!("{NUM_FILES_SENTINEL} {n}\n{MAX_STACK_DEPTH_SENTINEL} {d}\n");
        for lineno in 3..=total {
            if let Some((path, _)) = sources.iter().find(|(_, at)| *at == lineno) {
                out.push_str(&format!("zend_op_array op; {SOURCE_SENTINEL} {path}\n"));
            } else if levels.contains(&lineno) {
                out.push_str(&format!("if (level <= {lineno}) {{ {LEVEL_SENTINEL}\n"));
            } else {
                out.push_str("int unused;\n");
            }
        }
        out
    }

    #[test]
    fn test_round_trip() {
        let text = generated(100, &[("/tmp/a.php", 42)], &[60, 80], 1, 2);
        let map = LocationMap::parse(&text).unwrap();

        assert_eq!(map.break_line_for("file:///tmp/a.php"), Some(42));
        assert_eq!(map.break_line_for("file:///tmp/b.php"), None);
        assert_eq!(map.level_line(0), Some(60));
        assert_eq!(map.level_line(1), Some(80));
        assert_eq!(map.level_line(2), None);
        assert_eq!(map.max_stack_depth(), 2);
        assert_eq!(map.file_count(), 1);
    }

    #[test]
    fn test_multiple_sources() {
        let text = generated(
            50,
            &[("/srv/www/index.php", 10), ("/srv/www/lib.php", 20)],
            &[30],
            2,
            1,
        );
        let map = LocationMap::parse(&text).unwrap();
        assert_eq!(map.break_line_for("file:///srv/www/index.php"), Some(10));
        assert_eq!(map.break_line_for("file:///srv/www/lib.php"), Some(20));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let text = generated(50, &[("/tmp/a.php", 10), ("/tmp/a.php", 20)], &[30], 2, 1);
        let err = LocationMap::parse(&text).unwrap_err();
        assert!(matches!(err, Error::DuplicateMapping(url) if url == "file:///tmp/a.php"));
    }

    #[test]
    fn test_missing_sentinels() {
        assert!(matches!(
            LocationMap::parse(""),
            Err(Error::InstrumentationMalformed(_))
        ));
        assert!(matches!(
            LocationMap::parse("int x;\nint y;\n"),
            Err(Error::InstrumentationMalformed(_))
        ));
        // first sentinel present, second missing
        let text = format!("{NUM_FILES_SENTINEL} 1\nint y;\n");
        assert!(matches!(
            LocationMap::parse(&text),
            Err(Error::InstrumentationMalformed(_))
        ));
    }

    #[test]
    fn test_source_count_disagreement() {
        let text = generated(50, &[("/tmp/a.php", 10)], &[30], 2, 1);
        assert!(matches!(
            LocationMap::parse(&text),
            Err(Error::InstrumentationMalformed(_))
        ));
    }

    #[test]
    fn test_too_many_levels() {
        let text = generated(50, &[("/tmp/a.php", 10)], &[20, 30], 1, 1);
        assert!(matches!(
            LocationMap::parse(&text),
            Err(Error::InstrumentationMalformed(_))
        ));
    }

    #[test]
    fn test_sentinel_shares_line_with_code() {
        let text = generated(20, &[("/var/x.php", 7)], &[9], 1, 1);
        // sanity: the builder puts real C before the sentinel
        assert!(text.lines().nth(6).unwrap().starts_with("zend_op_array"));
        let map = LocationMap::parse(&text).unwrap();
        assert_eq!(map.break_line_for("file:///var/x.php"), Some(7));
    }
}
