//! In-place edits of compose and env files.
//!
//! Both editors are line based: only the value token on the matched line
//! changes, every other byte (comments, ordering, quoting, line endings)
//! is written back untouched. Files are rewritten in place rather than
//! renamed over, so single-file bind mounts keep pointing at them.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use dockup_registry::split_reference;

use crate::error::FileEditError;

static IMAGE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\s*image:\s*)(["']?)([^"'\s#]+)(["']?)(.*)$"#)
        .expect("image line regex is valid")
});

/// Result of a compose edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeEdit {
    /// The image tag was rewritten; `previous` is the tag found in the file.
    Updated { previous: Option<String> },
    /// The image reference uses `${...}` interpolation and was left alone.
    Interpolated,
}

fn read(path: &Path) -> Result<String, FileEditError> {
    std::fs::read_to_string(path).map_err(|source| FileEditError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), FileEditError> {
    std::fs::write(path, contents).map_err(|source| FileEditError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Split a line into its content and its terminator (`\n`, `\r\n`, or none).
fn split_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Set `var=value` in an env file, returning the previous value.
///
/// Every assignment of `var` (with or without `export`, quoted or not) is
/// rewritten. Fails with [`FileEditError::VariableNotFound`] if the file
/// has no assignment for it.
pub fn set_env_var(path: &Path, var: &str, value: &str) -> Result<String, FileEditError> {
    let contents = read(path)?;
    let line_re = Regex::new(&format!(
        r#"^(\s*(?:export\s+)?{}\s*=\s*)(["']?)([^"'\s#]*)(["']?)(.*)$"#,
        regex::escape(var)
    ))
    .map_err(|e| FileEditError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })?;

    let mut previous = None;
    let mut out = String::with_capacity(contents.len() + value.len());
    for line in contents.split_inclusive('\n') {
        let (body, ending) = split_ending(line);
        match line_re.captures(body) {
            Some(caps) => {
                previous.get_or_insert_with(|| caps[3].to_string());
                out.push_str(&caps[1]);
                out.push_str(&caps[2]);
                out.push_str(value);
                out.push_str(&caps[4]);
                out.push_str(&caps[5]);
                out.push_str(ending);
            }
            None => out.push_str(line),
        }
    }

    let previous = previous.ok_or_else(|| FileEditError::VariableNotFound {
        var: var.to_string(),
        path: path.to_path_buf(),
    })?;
    if out != contents {
        write(path, &out)?;
    }
    Ok(previous)
}

/// Point the `image:` of `service` in a compose file at `tag`.
///
/// The repository part of the reference is kept; a pinned digest is
/// dropped since it would contradict the new tag.
pub fn set_compose_tag(path: &Path, service: &str, tag: &str) -> Result<ComposeEdit, FileEditError> {
    let contents = read(path)?;
    let lines: Vec<&str> = contents.split_inclusive('\n').collect();

    let image_at = find_service_image(&lines, service).map_err(|missing| match missing {
        Missing::Service => FileEditError::ServiceNotFound {
            service: service.to_string(),
            path: path.to_path_buf(),
        },
        Missing::Image => FileEditError::ImageNotFound {
            service: service.to_string(),
            path: path.to_path_buf(),
        },
    })?;

    let (body, ending) = split_ending(lines[image_at]);
    let caps = IMAGE_LINE_RE
        .captures(body)
        .ok_or_else(|| FileEditError::ImageNotFound {
            service: service.to_string(),
            path: path.to_path_buf(),
        })?;
    let reference = &caps[3];
    if reference.contains('$') {
        return Ok(ComposeEdit::Interpolated);
    }

    let (repository, previous, _digest) = split_reference(reference);
    let rewritten = format!(
        "{}{}{repository}:{tag}{}{}{ending}",
        &caps[1], &caps[2], &caps[4], &caps[5]
    );

    let mut out = String::with_capacity(contents.len() + tag.len());
    for (i, line) in lines.iter().enumerate() {
        if i == image_at {
            out.push_str(&rewritten);
        } else {
            out.push_str(line);
        }
    }
    if out != contents {
        write(path, &out)?;
    }
    Ok(ComposeEdit::Updated {
        previous: previous.map(str::to_string),
    })
}

enum Missing {
    Service,
    Image,
}

/// Index of the `image:` line directly under `services.<service>`.
fn find_service_image(lines: &[&str], service: &str) -> Result<usize, Missing> {
    let services_at = lines
        .iter()
        .position(|l| {
            let (body, _) = split_ending(l);
            indent_of(body) == 0 && key_of(body) == Some("services")
        })
        .ok_or(Missing::Service)?;

    // Services sit at the first indent under `services:`; deeper keys
    // (`depends_on: {db: ...}`) are not services.
    let mut service_at = None;
    let mut services_indent = None;
    for (i, line) in lines.iter().enumerate().skip(services_at + 1) {
        let (body, _) = split_ending(line);
        if is_blank_or_comment(body) {
            continue;
        }
        let indent = indent_of(body);
        if indent == 0 {
            break;
        }
        let level = *services_indent.get_or_insert(indent);
        if indent == level && key_of(body) == Some(service) {
            service_at = Some(i);
            break;
        }
    }
    let service_at = service_at.ok_or(Missing::Service)?;
    let service_indent = indent_of(split_ending(lines[service_at]).0);

    let mut child_indent = None;
    for (i, line) in lines.iter().enumerate().skip(service_at + 1) {
        let (body, _) = split_ending(line);
        if is_blank_or_comment(body) {
            continue;
        }
        let indent = indent_of(body);
        if indent <= service_indent {
            break;
        }
        let child = *child_indent.get_or_insert(indent);
        if indent == child && IMAGE_LINE_RE.is_match(body) {
            return Ok(i);
        }
    }
    Err(Missing::Image)
}

/// Mapping key of a `key:` line, unquoted.
fn key_of(body: &str) -> Option<&str> {
    let trimmed = body.trim();
    let (key, rest) = trimmed.split_once(':')?;
    let rest = rest.trim_start();
    if !(rest.is_empty() || rest.starts_with('#')) {
        return None;
    }
    Some(key.trim().trim_matches(|c| c == '"' || c == '\''))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn file_with(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn contents(file: &tempfile::NamedTempFile) -> String {
        std::fs::read_to_string(file.path()).unwrap()
    }

    #[test]
    fn env_edit_changes_only_the_value() {
        let file = file_with(
            "# media stack\nRADARR_VERSION=5.2.1  # pinned\nexport SONARR_VERSION=\"4.0.0\"\r\nOTHER=1\n",
        );

        let previous = set_env_var(file.path(), "RADARR_VERSION", "5.3.0").unwrap();
        assert_eq!(previous, "5.2.1");
        let previous = set_env_var(file.path(), "SONARR_VERSION", "4.0.1").unwrap();
        assert_eq!(previous, "4.0.0");

        assert_eq!(
            contents(&file),
            "# media stack\nRADARR_VERSION=5.3.0  # pinned\nexport SONARR_VERSION=\"4.0.1\"\r\nOTHER=1\n"
        );
    }

    #[test]
    fn env_var_name_is_matched_exactly() {
        let file = file_with("APP_VERSION_OLD=1\nAPP_VERSION=2\n");
        set_env_var(file.path(), "APP_VERSION", "3").unwrap();
        assert_eq!(contents(&file), "APP_VERSION_OLD=1\nAPP_VERSION=3\n");
    }

    #[test]
    fn missing_env_var_fails_without_writing() {
        let file = file_with("OTHER=1\n");
        let err = set_env_var(file.path(), "APP_VERSION", "3").unwrap_err();
        assert!(matches!(err, FileEditError::VariableNotFound { .. }));
        assert_eq!(contents(&file), "OTHER=1\n");
    }

    #[test]
    fn missing_env_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = set_env_var(&dir.path().join("absent.env"), "X", "1").unwrap_err();
        assert!(matches!(err, FileEditError::Io { .. }));
    }

    const COMPOSE: &str = "\
# stack
services:
  radarr:
    image: lscr.io/linuxserver/radarr:5.2.1   # keep this comment
    environment:
      - PUID=1000
  sonarr:
    container_name: sonarr
    image: \"lscr.io/linuxserver/sonarr:4.0.0\"
volumes:
  data: {}
";

    #[test]
    fn compose_edit_rewrites_one_tag() {
        let file = file_with(COMPOSE);
        let edit = set_compose_tag(file.path(), "sonarr", "4.0.1").unwrap();
        assert_eq!(
            edit,
            ComposeEdit::Updated {
                previous: Some("4.0.0".to_string())
            }
        );
        assert_eq!(
            contents(&file),
            COMPOSE.replace("sonarr:4.0.0", "sonarr:4.0.1")
        );

        set_compose_tag(file.path(), "radarr", "5.3.0").unwrap();
        let after = contents(&file);
        assert!(after.contains("image: lscr.io/linuxserver/radarr:5.3.0   # keep this comment\n"));
    }

    #[test]
    fn compose_edit_keeps_registry_port_and_drops_digest() {
        let file = file_with("services:\n  app:\n    image: registry.local:5000/team/app:1.0@sha256:abc\n");
        set_compose_tag(file.path(), "app", "1.1").unwrap();
        assert_eq!(
            contents(&file),
            "services:\n  app:\n    image: registry.local:5000/team/app:1.1\n"
        );
    }

    #[test]
    fn compose_edit_adds_tag_to_untagged_image() {
        let file = file_with("services:\n  web:\n    image: nginx\n");
        let edit = set_compose_tag(file.path(), "web", "1.27").unwrap();
        assert_eq!(edit, ComposeEdit::Updated { previous: None });
        assert_eq!(contents(&file), "services:\n  web:\n    image: nginx:1.27\n");
    }

    #[test]
    fn nested_key_does_not_shadow_service() {
        let file = file_with(
            "services:\n  app:\n    image: app:1\n    depends_on:\n      db:\n        condition: service_healthy\n  db:\n    image: postgres:16\n",
        );
        let edit = set_compose_tag(file.path(), "db", "17").unwrap();
        assert_eq!(
            edit,
            ComposeEdit::Updated {
                previous: Some("16".to_string())
            }
        );
        assert_eq!(
            contents(&file),
            "services:\n  app:\n    image: app:1\n    depends_on:\n      db:\n        condition: service_healthy\n  db:\n    image: postgres:17\n"
        );
    }

    #[test]
    fn interpolated_image_is_left_alone() {
        let original = "services:\n  app:\n    image: ghcr.io/org/app:${APP_VERSION}\n";
        let file = file_with(original);
        let edit = set_compose_tag(file.path(), "app", "2.0").unwrap();
        assert_eq!(edit, ComposeEdit::Interpolated);
        assert_eq!(contents(&file), original);
    }

    #[test]
    fn unknown_service_and_missing_image() {
        let file = file_with(COMPOSE);
        assert!(matches!(
            set_compose_tag(file.path(), "lidarr", "1"),
            Err(FileEditError::ServiceNotFound { .. })
        ));

        let file = file_with("services:\n  app:\n    build: .\n");
        assert!(matches!(
            set_compose_tag(file.path(), "app", "1"),
            Err(FileEditError::ImageNotFound { .. })
        ));
        assert_eq!(contents(&file), "services:\n  app:\n    build: .\n");
    }

    #[test]
    fn nested_image_keys_are_ignored() {
        let original = "services:\n  app:\n    x-meta:\n      image: not-this:1\n    image: org/app:1.0\n";
        let file = file_with(original);
        set_compose_tag(file.path(), "app", "1.1").unwrap();
        assert_eq!(contents(&file), original.replace("org/app:1.0", "org/app:1.1"));
    }
}
