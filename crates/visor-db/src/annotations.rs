//! Plain-text annotation files.
//!
//! One annotated image per line: `<relative-path> <anno> <unused> <unused>`
//! where `anno` is 1 (positive), 0 (neutral) or -1 (negative). Paths must
//! not contain whitespace. Blank lines are ignored.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::debug;

use visor_core::{Annotation, AnnotationLabel, Error, Result};

use crate::paths::relative_path;

/// Write every path as a positive annotation.
///
/// Paths are made relative to the first of `bases` that contains them;
/// paths under none of them are written unchanged. Every path is checked
/// before `file` is touched.
pub fn save_annotations(file: &Path, paths: &[String], bases: &[&Path]) -> Result<usize> {
    let rels = paths
        .iter()
        .map(|p| {
            let rel = relative_path(Path::new(p), bases).unwrap_or_else(|| p.clone());
            if rel.chars().any(char::is_whitespace) {
                return Err(Error::InvalidRequest(format!(
                    "cannot annotate path containing whitespace: {}",
                    rel
                )));
            }
            Ok(rel)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut writer = BufWriter::new(File::create(file)?);
    for rel in &rels {
        writeln!(writer, "{} {} 0 0", rel, AnnotationLabel::Positive.as_i32())?;
    }
    writer.flush()?;
    debug!(image_count = paths.len(), file = %file.display(), "Annotations saved");
    Ok(paths.len())
}

/// Parse an annotation file.
pub fn load_annotations(file: &Path) -> Result<Vec<Annotation>> {
    let reader = BufReader::new(File::open(file).map_err(|e| {
        Error::InvalidAnnoFile(format!("cannot open {}: {}", file.display(), e))
    })?);

    let mut annotations = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let Some(path) = fields.next() else {
            continue;
        };
        let anno = fields
            .next()
            .ok_or_else(|| bad_line(file, lineno, "missing annotation value"))?
            .parse::<i32>()
            .map_err(|_| bad_line(file, lineno, "annotation value is not an integer"))?;
        let anno = AnnotationLabel::try_from(anno)
            .map_err(|_| bad_line(file, lineno, "annotation value must be 1, 0 or -1"))?;
        annotations.push(Annotation {
            path: path.to_string(),
            anno,
        });
    }
    Ok(annotations)
}

fn bad_line(file: &Path, lineno: usize, what: &str) -> Error {
    Error::InvalidAnnoFile(format!("{}:{}: {}", file.display(), lineno + 1, what))
}
