/*
 * Copyright (C) 2024-2025 the Zibai authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::logger;
use log::{debug, info};
use notify::Watcher;
use std::path::Path;
use std::sync::mpsc;

const IGNORE_DIRS: &[&str] = &[".git", "target", "__pycache__", "node_modules"];

/// Watches the working directory for changes matching a semicolon-separated
/// glob list and delivers one reload edge per matching event.
pub struct Reloader {
    _watcher: notify::RecommendedWatcher,
}

impl Reloader {
    pub fn start(patterns: &str, tx: mpsc::Sender<()>) -> Result<Self, notify::Error> {
        let patterns: Vec<String> = patterns
            .split(';')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut watcher =
            notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("watch error: {:?}", e);
                        return;
                    }
                };

                if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                    return;
                }

                if event.paths.iter().any(|p| path_matches(&patterns, p)) {
                    info!(target: logger::PROCESS, "detected file change, reloading");
                    let _ = tx.send(());
                }
            })?;

        let cwd = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));

        info!(
            target: logger::PROCESS,
            "watching files in {}",
            cwd.display()
        );

        watcher.watch(&cwd, notify::RecursiveMode::Recursive)?;

        Ok(Self { _watcher: watcher })
    }
}

fn path_matches(patterns: &[String], path: &Path) -> bool {
    for part in path.iter() {
        if let Some(part) = part.to_str() {
            if IGNORE_DIRS.contains(&part) {
                return false;
            }
        }
    }

    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };

    let full = path.to_string_lossy();

    patterns
        .iter()
        .any(|p| glob_match(p, name) || glob_match(p, &full))
}

/// Minimal fnmatch-style matching: `*` matches any run of characters,
/// `?` matches a single character.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                if inner(&p[1..], v) {
                    return true;
                }

                match v.first() {
                    Some(_) => inner(p, &v[1..]),
                    None => false,
                }
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &v[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }

    inner(pattern.as_bytes(), value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.py", "app.py"));
        assert!(glob_match("*.py", ".py"));
        assert!(!glob_match("*.py", "app.pyc"));
        assert!(glob_match("app?.toml", "app1.toml"));
        assert!(!glob_match("app?.toml", "app.toml"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("src/*.rs", "src/main.rs"));
    }

    #[test]
    fn test_path_matches() {
        let patterns = vec!["*.rs".to_string(), "*.toml".to_string()];

        assert!(path_matches(&patterns, &PathBuf::from("/proj/src/main.rs")));
        assert!(path_matches(&patterns, &PathBuf::from("Cargo.toml")));
        assert!(!path_matches(&patterns, &PathBuf::from("/proj/notes.txt")));
        assert!(!path_matches(
            &patterns,
            &PathBuf::from("/proj/target/debug/build.rs")
        ));
        assert!(!path_matches(
            &patterns,
            &PathBuf::from("/proj/.git/config.toml")
        ));
    }
}
