//! Parser for the metadata directives embedded in handler code.
//!
//! The handler file may contain comment lines such as:
//!
//! ```text
//! # ol-install: parso,jedi,idna,chardet,certifi,requests
//! # ol-import: parso,jedi,idna,chardet,certifi,requests,urllib3
//! # ol-timeout: 30
//! ```
//!
//! The install list is handed to the package installer; the import list is a
//! warm-start hint for the import cache; the timeout is a per-function limit
//! in milliseconds. Exact version pins (`pkg==2.0.0`) are supported, ranges
//! are not.

use std::path::Path;

use lambda_common::{normalize_pkg, Result, SandboxMeta};
use tracing::warn;

/// Name of the handler entry point inside a code directory.
pub const HANDLER_FILE: &str = "f.py";

const INSTALL_KEY: &str = "#ol-install";
const IMPORT_KEY: &str = "#ol-import";
const TIMEOUT_KEY: &str = "#ol-timeout";

/// Scan the handler file in `code_dir` for directives. Spaces are stripped
/// inside each line before matching, so `# ol-install: a, b` and
/// `#ol-install:a,b` read the same.
pub async fn parse_meta(code_dir: &Path) -> Result<SandboxMeta> {
    let path = code_dir.join(HANDLER_FILE);
    let source = tokio::fs::read_to_string(&path).await?;
    Ok(parse_source(&source, code_dir))
}

fn parse_source(source: &str, code_dir: &Path) -> SandboxMeta {
    let mut meta = SandboxMeta::default();

    for raw in source.lines() {
        let line: String = raw.chars().filter(|c| *c != ' ').collect();
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 2 {
            warn!(
                "ignoring malformed metadata line in {}; expected key:value",
                code_dir.display()
            );
            continue;
        }

        match parts[0] {
            INSTALL_KEY => meta.installs.extend(split_list(parts[1])),
            IMPORT_KEY => meta.imports.extend(split_list(parts[1])),
            TIMEOUT_KEY => match parts[1].parse::<i64>() {
                Ok(ms) => meta.timeout_ms = ms,
                Err(_) => {
                    warn!(
                        "malformed value for {} in {}; directive ignored",
                        TIMEOUT_KEY,
                        code_dir.display()
                    );
                }
            },
            key => warn!(
                "ignoring unrecognised metadata key {:?} in {}",
                key,
                code_dir.display()
            ),
        }
    }

    meta.installs = meta
        .installs
        .iter()
        .map(|pkg| normalize_pkg(pkg))
        .collect();

    meta
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
