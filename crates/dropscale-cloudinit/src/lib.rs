//! dropscale-cloudinit — user-data composition.
//!
//! New workers receive a boot-time shell fragment (the secure
//! introduction writer) prepended to whatever user-data the operator
//! configured. The operator's data may be empty, a bare shell script,
//! or a cloud-config-archive; all three are normalized into a
//! cloud-config-archive with the new fragment as the first part.
//!
//! MIME multipart user-data is rejected: the archive format expresses
//! the same ordered-parts structure and survives round-trips without
//! boundary bookkeeping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First line of a cloud-config-archive document.
pub const ARCHIVE_HEADER: &str = "#cloud-config-archive";

const SHELL_PART_TYPE: &str = "text/x-shellscript";

/// One boot-time part of a cloud-config-archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePart {
    #[serde(rename = "type")]
    pub part_type: String,
    pub content: String,
}

impl ArchivePart {
    /// A shell-script part.
    pub fn shell(content: impl Into<String>) -> Self {
        Self {
            part_type: SHELL_PART_TYPE.to_string(),
            content: content.into(),
        }
    }
}

/// User-data composition failures.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("MIME multipart user data is not supported")]
    MimeUnsupported,

    #[error("unrecognised user data format")]
    UnrecognisedFormat,

    #[error("invalid cloud-config-archive: {0}")]
    Archive(#[from] serde_yaml::Error),
}

/// Prepend `script` as a boot-time shell part to `original` user-data.
///
/// `original` is recognized by prefix after trimming surrounding
/// whitespace:
/// - empty: the result is an archive holding just the new part;
/// - `#!`: the original script becomes the second part;
/// - `#cloud-config-archive`: the existing parts follow the new one;
/// - `Content-Type:` (MIME multipart): rejected;
/// - anything else: rejected as unrecognised.
pub fn prepend_shell_script(original: &str, script: &str) -> Result<String, ComposeError> {
    let original = original.trim();

    if original.is_empty() {
        return Ok(emit_archive(&[ArchivePart::shell(script)]));
    }

    if original.starts_with("Content-Type:") {
        return Err(ComposeError::MimeUnsupported);
    }

    if original.starts_with("#!") {
        return Ok(emit_archive(&[
            ArchivePart::shell(script),
            ArchivePart::shell(original),
        ]));
    }

    if let Some(rest) = strip_archive_header(original) {
        let mut parts = parse_archive_parts(rest)?;
        parts.insert(0, ArchivePart::shell(script));
        return Ok(emit_archive(&parts));
    }

    Err(ComposeError::UnrecognisedFormat)
}

fn strip_archive_header(data: &str) -> Option<&str> {
    data.strip_prefix(ARCHIVE_HEADER)
        .and_then(|rest| rest.strip_prefix('\n'))
}

/// Parse the part list that follows the archive header.
///
/// A parse failure fails the whole composition; a malformed archive is
/// not repaired.
pub fn parse_archive_parts(yaml: &str) -> Result<Vec<ArchivePart>, ComposeError> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Emit parts in the normalized archive form.
///
/// Types are unquoted, keys are indented two spaces, content is a
/// literal block indented two further spaces, and trailing blank lines
/// inside content are dropped. Parsing the output reproduces the same
/// parts, so emit∘parse is a fixpoint.
pub fn emit_archive(parts: &[ArchivePart]) -> String {
    let mut out = String::from(ARCHIVE_HEADER);
    out.push('\n');
    for part in parts {
        out.push_str("- type: ");
        out.push_str(&part.part_type);
        out.push('\n');
        out.push_str("  content: |\n");
        for line in part.content.trim_end_matches('\n').split('\n') {
            if line.is_empty() {
                out.push('\n');
            } else {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "#!/bin/sh\necho hello > /run/target\n";

    #[test]
    fn empty_user_data_becomes_single_part_archive() {
        let out = prepend_shell_script("", SCRIPT).unwrap();
        assert_eq!(
            out,
            "#cloud-config-archive\n\
             - type: text/x-shellscript\n\
             \x20 content: |\n\
             \x20   #!/bin/sh\n\
             \x20   echo hello > /run/target\n"
        );
    }

    #[test]
    fn whitespace_only_user_data_counts_as_empty() {
        let out = prepend_shell_script("  \n\t\n", SCRIPT).unwrap();
        let parts = parse_archive_parts(strip_archive_header(&out).unwrap()).unwrap();
        assert_eq!(parts, vec![ArchivePart::shell(SCRIPT)]);
    }

    #[test]
    fn bare_shell_script_becomes_second_part() {
        let original = "#!/bin/bash\napt-get update\n";
        let out = prepend_shell_script(original, SCRIPT).unwrap();
        let parts = parse_archive_parts(strip_archive_header(&out).unwrap()).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_type, "text/x-shellscript");
        assert_eq!(parts[0].content, SCRIPT);
        assert_eq!(parts[1].content, "#!/bin/bash\napt-get update\n");
    }

    #[test]
    fn existing_archive_keeps_parts_after_new_one() {
        let original = "#cloud-config-archive\n\
                        - type: \"text/cloud-config\"\n\
                        \x20 content: |\n\
                        \x20   packages:\n\
                        \x20    - jq\n";
        let out = prepend_shell_script(original, SCRIPT).unwrap();
        let parts = parse_archive_parts(strip_archive_header(&out).unwrap()).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content, SCRIPT);
        assert_eq!(parts[1].part_type, "text/cloud-config");
        assert_eq!(parts[1].content, "packages:\n - jq\n");
    }

    #[test]
    fn quoted_types_are_normalized_away() {
        let original = "#cloud-config-archive\n\
                        - type: \"text/x-shellscript\"\n\
                        \x20 content: |\n\
                        \x20   #!/bin/sh\n\
                        \x20   true\n";
        let out = prepend_shell_script(original, SCRIPT).unwrap();
        assert!(!out.contains('"'));
    }

    #[test]
    fn emit_is_a_fixpoint_of_parse() {
        let original = "#cloud-config-archive\n\
                        - type: text/cloud-config\n\
                        \x20 content: |\n\
                        \x20   runcmd:\n\
                        \x20    - echo one\n\
                        - type: text/x-shellscript\n\
                        \x20 content: |\n\
                        \x20   #!/bin/sh\n\
                        \x20   echo two\n";
        let out = prepend_shell_script(original, SCRIPT).unwrap();
        let parts = parse_archive_parts(strip_archive_header(&out).unwrap()).unwrap();
        assert_eq!(emit_archive(&parts), out);
    }

    #[test]
    fn trailing_blank_lines_in_content_are_stripped() {
        let part = ArchivePart::shell("#!/bin/sh\necho done\n\n\n");
        let out = emit_archive(&[part]);
        assert!(out.ends_with("    echo done\n"));
        let parts = parse_archive_parts(strip_archive_header(&out).unwrap()).unwrap();
        assert_eq!(parts[0].content, "#!/bin/sh\necho done\n");
    }

    #[test]
    fn interior_blank_lines_survive_round_trips() {
        let part = ArchivePart::shell("#!/bin/sh\n\necho spaced\n");
        let out = emit_archive(&[part]);
        let parts = parse_archive_parts(strip_archive_header(&out).unwrap()).unwrap();
        assert_eq!(parts[0].content, "#!/bin/sh\n\necho spaced\n");
    }

    #[test]
    fn mime_multipart_is_rejected() {
        let original = "Content-Type: multipart/mixed; boundary=\"xyz\"\nMIME-Version: 1.0\n";
        assert!(matches!(
            prepend_shell_script(original, SCRIPT),
            Err(ComposeError::MimeUnsupported)
        ));
    }

    #[test]
    fn unknown_formats_are_rejected() {
        assert!(matches!(
            prepend_shell_script("just some text", SCRIPT),
            Err(ComposeError::UnrecognisedFormat)
        ));
        // A lone header with no newline is not a parseable archive.
        assert!(matches!(
            prepend_shell_script("#cloud-config-archive", SCRIPT),
            Err(ComposeError::UnrecognisedFormat)
        ));
    }

    #[test]
    fn malformed_archive_yaml_fails() {
        let original = "#cloud-config-archive\n- type: [unclosed\n";
        assert!(matches!(
            prepend_shell_script(original, SCRIPT),
            Err(ComposeError::Archive(_))
        ));
    }
}
