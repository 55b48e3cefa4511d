//! Generated block of the renderer's config file
//!
//! The renderer config is split at [`GENERATED_MARKER`]. Everything before
//! the marker line belongs to the operator and is carried over verbatim;
//! the marker and everything after it is rebuilt from the template list on
//! every regeneration. Nothing is patched incrementally.

use mct_core::io::{self, IoError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Line separating the preserved prefix from the generated block
pub const GENERATED_MARKER: &str = "//GENERATED BY MULTI-CONSUL-TEMPLATE";

/// Where the renderer writes a template's output: the template path with
/// its last extension stripped (`nginx.conf.ctmpl` → `nginx.conf`).
pub fn rendered_destination(template: &Path) -> PathBuf {
    template.with_extension("")
}

/// Bytes of `previous` before the marker line, or all of it if there is no
/// marker. Line endings are kept as they are.
pub fn preserved_prefix(previous: &str) -> &str {
    let mut end = 0;
    for line in previous.split_inclusive('\n') {
        if line.trim_end() == GENERATED_MARKER {
            return &previous[..end];
        }
        end += line.len();
    }
    previous
}

/// Build the full config text from the previous content and the template list.
///
/// The prefix is copied unchanged. The only byte ever added to it is a `\n`
/// when a config without a marker does not end in a newline, so the marker
/// starts its own line.
pub fn render_config(previous: &str, templates: &[PathBuf]) -> String {
    let prefix = preserved_prefix(previous);
    let mut out = String::with_capacity(prefix.len() + GENERATED_MARKER.len() + 1);
    out.push_str(prefix);
    if !prefix.is_empty() && !prefix.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(GENERATED_MARKER);
    out.push('\n');
    for template in templates {
        out.push_str(&render_stanza(template));
    }
    out
}

/// One `template { ... }` stanza.
pub fn render_stanza(template: &Path) -> String {
    format!(
        "template {{\nsource = \"{}\"\ndestination = \"{}\"\n}}\n",
        hcl_escape(&template.display().to_string()),
        hcl_escape(&rendered_destination(template).display().to_string())
    )
}

/// Rewrite `config_path` with a fresh generated block.
///
/// A missing config file is treated as empty.
pub fn regenerate(config_path: &Path, templates: &[PathBuf]) -> Result<(), IoError> {
    let previous = io::read_to_string_or_empty(config_path)?;
    let next = render_config(&previous, templates);
    io::write_durable(config_path, next.as_bytes())?;
    debug!(
        "Regenerated {} with {} template(s)",
        config_path.display(),
        templates.len()
    );
    Ok(())
}

fn hcl_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rendered_destination() {
        assert_eq!(
            rendered_destination(Path::new("/etc/ct/nginx.conf.ctmpl")),
            PathBuf::from("/etc/ct/nginx.conf")
        );
        assert_eq!(
            rendered_destination(Path::new("/etc/ct/a.ctmpl")),
            PathBuf::from("/etc/ct/a")
        );
    }

    #[test]
    fn test_render_without_marker_keeps_everything() {
        let previous = "consul { address = \"127.0.0.1:8500\" }\nlog_level = \"info\"";
        let rendered = render_config(previous, &[PathBuf::from("/etc/ct/a.ctmpl")]);
        assert_eq!(
            rendered,
            "consul { address = \"127.0.0.1:8500\" }\n\
             log_level = \"info\"\n\
             //GENERATED BY MULTI-CONSUL-TEMPLATE\n\
             template {\n\
             source = \"/etc/ct/a.ctmpl\"\n\
             destination = \"/etc/ct/a\"\n\
             }\n"
        );
    }

    #[test]
    fn test_render_replaces_old_block() {
        let previous = "wait { min = \"2s\" }\n\
                        //GENERATED BY MULTI-CONSUL-TEMPLATE\n\
                        template {\n\
                        source = \"/etc/ct/stale.ctmpl\"\n\
                        destination = \"/etc/ct/stale\"\n\
                        }\n";
        let rendered = render_config(previous, &[]);
        assert_eq!(
            rendered,
            "wait { min = \"2s\" }\n//GENERATED BY MULTI-CONSUL-TEMPLATE\n"
        );
    }

    #[test]
    fn test_render_keeps_crlf_prefix_bytes() {
        let previous = "log_level = \"warn\"\r\nmax_stale = \"1m\"\r\n";
        let once = render_config(previous, &[PathBuf::from("/etc/ct/a.ctmpl")]);
        assert!(once.starts_with(previous));
        assert_eq!(preserved_prefix(&once), previous);

        let twice = render_config(&once, &[]);
        assert_eq!(
            twice,
            format!("{previous}{GENERATED_MARKER}\n")
        );
    }

    #[test]
    fn test_render_with_crlf_marker_line() {
        let previous = "wait { min = \"2s\" }\r\n//GENERATED BY MULTI-CONSUL-TEMPLATE\r\ntemplate {\r\n}\r\n";
        assert_eq!(preserved_prefix(previous), "wait { min = \"2s\" }\r\n");
    }

    #[test]
    fn test_prefix_without_trailing_newline_gets_one_separator() {
        let once = render_config("log_level = \"info\"", &[]);
        assert_eq!(once, format!("log_level = \"info\"\n{GENERATED_MARKER}\n"));
        // From then on the prefix is stable
        assert_eq!(render_config(&once, &[]), once);
    }

    #[test]
    fn test_render_is_idempotent() {
        let templates = vec![
            PathBuf::from("/etc/ct/b.ctmpl"),
            PathBuf::from("/etc/ct/a.ctmpl"),
        ];
        let once = render_config("max_stale = \"10m\"\n", &templates);
        let twice = render_config(&once, &templates);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_stanza_escapes_quotes() {
        let stanza = render_stanza(Path::new("/etc/ct/we\"ird.ctmpl"));
        assert!(stanza.contains("source = \"/etc/ct/we\\\"ird.ctmpl\""));
    }

    #[test]
    fn test_regenerate_preserves_prefix_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let config = temp_dir.path().join("config.hcl");
        std::fs::write(&config, "reload_signal = \"SIGHUP\"\n").unwrap();

        regenerate(&config, &[PathBuf::from("/t/a.ctmpl")]).unwrap();
        regenerate(&config, &[PathBuf::from("/t/b.ctmpl")]).unwrap();

        let contents = std::fs::read_to_string(&config).unwrap();
        assert!(contents.starts_with("reload_signal = \"SIGHUP\"\n//GENERATED BY MULTI-CONSUL-TEMPLATE\n"));
        assert!(contents.contains("/t/b.ctmpl"));
        assert!(!contents.contains("/t/a.ctmpl"));
    }

    #[test]
    fn test_regenerate_creates_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = temp_dir.path().join("config.hcl");

        regenerate(&config, &[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&config).unwrap(),
            format!("{GENERATED_MARKER}\n")
        );
    }
}
