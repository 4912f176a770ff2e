//! Plain-text export from a searchable PDF.
//!
//! Thin convenience over the document collaborator: once a document has a
//! text layer, its content can be dumped page by page for indexing or
//! diffing against a reference transcription.

use crate::document::{DocumentBackend, SourceDocument};
use crate::error::ConvertError;
use std::io::Write;
use std::path::Path;

/// Write the document's extractable text to `txt_path`, one page per
/// section separated by a header line.
pub fn export_text<B: DocumentBackend>(
    backend: &B,
    pdf_path: &Path,
    txt_path: &Path,
) -> Result<(), ConvertError> {
    let source = backend.open(pdf_path, None)?;

    let file = std::fs::File::create(txt_path).map_err(|source| ConvertError::OutputWriteFailed {
        path: txt_path.to_path_buf(),
        source,
    })?;
    let mut writer = std::io::BufWriter::new(file);

    let write_err = |source| ConvertError::OutputWriteFailed {
        path: txt_path.to_path_buf(),
        source,
    };

    for index in 0..source.page_count() {
        let text = source.page_text(index);
        writeln!(writer, "--- Page {} ---", index + 1).map_err(write_err)?;
        writeln!(writer).map_err(write_err)?;
        writeln!(writer, "{}", text.trim()).map_err(write_err)?;
        writeln!(writer).map_err(write_err)?;
    }

    writer.flush().map_err(write_err)?;
    Ok(())
}
