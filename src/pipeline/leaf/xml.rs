//! Shared helpers for the OOXML (zip + XML) converters.

use crate::error::LeafError;
use quick_xml::events::BytesStart;
use std::io::{Cursor, Read};
use zip::ZipArchive;

pub(super) type Package<'a> = ZipArchive<Cursor<&'a [u8]>>;

pub(super) fn open_package<'a>(
    format: &'static str,
    bytes: &'a [u8],
) -> Result<Package<'a>, LeafError> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| LeafError::Malformed {
        format,
        detail: format!("not a zip package: {e}"),
    })
}

/// Read a part as UTF-8. `Ok(None)` if the part does not exist.
pub(super) fn read_part(
    format: &'static str,
    package: &mut Package<'_>,
    name: &str,
) -> Result<Option<String>, LeafError> {
    let mut entry = match package.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(LeafError::Malformed {
                format,
                detail: format!("{name}: {e}"),
            })
        }
    };
    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| LeafError::Malformed {
            format,
            detail: format!("{name}: {e}"),
        })?;
    Ok(Some(xml))
}

pub(super) fn xml_error(format: &'static str, part: &str, e: quick_xml::Error) -> LeafError {
    LeafError::Malformed {
        format,
        detail: format!("{part}: {e}"),
    }
}

/// Value of the attribute whose local name is `key`, ignoring the prefix.
pub(super) fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// OOXML on/off properties: absent `val` means on.
pub(super) fn is_on(e: &BytesStart<'_>) -> bool {
    !matches!(
        attr(e, b"val").as_deref(),
        Some("0") | Some("false") | Some("off") | Some("none")
    )
}
