//! Builds banks from a directory of sample files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::Result;

const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "ogg", "flac", "aac", "m4a"];

fn is_audio_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                AUDIO_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Scans `dir` into a bank map of `file://` URLs.
///
/// Each subfolder becomes a bank named after the folder, its audio files in
/// name order so `n` picks the same file on every scan. Audio files at the
/// top level become single-sample banks named by their stem. Folders without
/// audio are skipped.
pub fn scan_sample_dir(dir: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let mut banks = BTreeMap::new();

    for path in sorted_entries(dir)? {
        if path.is_dir() {
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let files = match sorted_entries(&path) {
                Ok(files) => files,
                Err(e) => {
                    warn!(folder = %path.display(), error = %e, "skipping unreadable folder");
                    continue;
                }
            };
            let urls: Vec<String> = files
                .iter()
                .filter(|file| is_audio_file(file))
                .map(|file| file_url(file))
                .collect();
            if !urls.is_empty() {
                debug!(bank = name, count = urls.len(), "found sample folder");
                banks.insert(name.to_string(), urls);
            }
        } else if is_audio_file(&path) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                banks.insert(stem.to_string(), vec![file_url(&path)]);
            }
        }
    }

    Ok(banks)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn touch(path: &Path) {
        fs::write(path, b"RIFF").unwrap();
    }

    #[test]
    fn folders_become_banks_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let bd = dir.path().join("bd");
        fs::create_dir(&bd).unwrap();
        touch(&bd.join("b.wav"));
        touch(&bd.join("a.WAV"));
        touch(&bd.join("notes.txt"));
        fs::create_dir(dir.path().join("empty")).unwrap();
        touch(&dir.path().join("clap.flac"));
        touch(&dir.path().join("readme.md"));

        let banks = scan_sample_dir(dir.path()).unwrap();

        assert_eq!(
            banks.keys().cloned().collect::<Vec<_>>(),
            vec!["bd".to_string(), "clap".to_string()]
        );
        assert_eq!(
            banks["bd"],
            vec![file_url(&bd.join("a.WAV")), file_url(&bd.join("b.wav"))]
        );
        assert_eq!(banks["clap"], vec![file_url(&dir.path().join("clap.flac"))]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_sample_dir(&dir.path().join("gone")).is_err());
    }
}
