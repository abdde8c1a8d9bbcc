//! Turns the `NODM_X_OPTIONS` command-line fragment into a concrete X server
//! argv, following the word-expansion algorithm `dm.c` uses to build
//! `xserver->argv` from the `xcmd` configuration string.

const DEFAULT_X_BIN: &str = "/usr/bin/X";
const DEFAULT_DISPLAY: &str = ":0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedXOptions {
    pub argv: Vec<String>,
    pub display_name: String,
    /// `true` if a `vt<digits>` token was already present, which means the
    /// VT allocator must not run and must not append its own `vt<N>`.
    pub vt_override: bool,
}

fn looks_like_display(token: &str) -> bool {
    let mut chars = token.chars();
    chars.next() == Some(':') && chars.next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}

fn looks_like_vt(token: &str) -> bool {
    token
        .strip_prefix("vt")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Parse `NODM_X_OPTIONS` into a server argv. `raw` has already been through
/// shell-style word splitting (no command substitution): see
/// [`shell_split`].
pub fn parse_words(words: Vec<String>) -> ParsedXOptions {
    let mut words = words.into_iter();

    let bin = match words.next() {
        Some(first) if first.starts_with('/') || first.starts_with('.') => first,
        Some(first) => {
            // Not a path: it is the start of the "remaining tokens" run,
            // and the default binary is prepended ahead of it.
            let mut argv = vec![DEFAULT_X_BIN.to_string()];
            return finish(argv_with_display(&mut argv, Some(first), words));
        }
        None => {
            // Nothing supplied at all: the fully-default case. Synthesize
            // the full default invocation, including `-nolisten tcp`, which
            // only applies when the operator configured nothing whatsoever.
            let mut argv = vec![DEFAULT_X_BIN.to_string(), DEFAULT_DISPLAY.to_string()];
            argv.push("-nolisten".to_string());
            argv.push("tcp".to_string());
            return finish(argv);
        }
    };

    let mut argv = vec![bin];
    finish(argv_with_display(&mut argv, words.next(), words))
}

fn argv_with_display(
    argv: &mut Vec<String>,
    next: Option<String>,
    rest: impl Iterator<Item = String>,
) -> Vec<String> {
    match next {
        Some(token) if looks_like_display(&token) => {
            argv.push(token);
        }
        Some(token) => {
            argv.push(DEFAULT_DISPLAY.to_string());
            argv.push(token);
        }
        None => {
            argv.push(DEFAULT_DISPLAY.to_string());
        }
    }

    argv.extend(rest);
    std::mem::take(argv)
}

fn finish(argv: Vec<String>) -> ParsedXOptions {
    let display_name = argv
        .iter()
        .find(|token| looks_like_display(token))
        .cloned()
        .unwrap_or_else(|| DEFAULT_DISPLAY.to_string());
    let vt_override = argv.iter().any(|token| looks_like_vt(token));

    ParsedXOptions {
        argv,
        display_name,
        vt_override,
    }
}

/// POSIX word-splitting without command substitution, matching the
/// original's use of `wordexp(..., WRDE_NOCMD)`.
pub fn shell_split(input: &str) -> Result<Vec<String>, crate::error::Error> {
    shell_words::split(input)
        .map_err(|err| crate::error::Error::BadArg(format!("invalid NODM_X_OPTIONS: {err}")))
}

/// Append the allocated VT number to an X server argv, as `vt<N>`.
pub fn append_vt(argv: &mut Vec<String>, vt: u32) {
    argv.push(format!("vt{vt}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> ParsedXOptions {
        parse_words(shell_split(input).unwrap())
    }

    #[test]
    fn empty_input_synthesizes_default_argv() {
        let parsed = parse("");
        assert_eq!(
            parsed.argv,
            vec!["/usr/bin/X", ":0", "-nolisten", "tcp"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert_eq!(parsed.display_name, ":0");
        assert!(!parsed.vt_override);
    }

    #[test]
    fn nested_server_with_explicit_display() {
        let parsed = parse("/usr/bin/Xnest :1 foo");
        assert_eq!(
            parsed.argv,
            vec!["/usr/bin/Xnest", ":1", "foo"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert_eq!(parsed.display_name, ":1");
        assert!(!parsed.vt_override);
    }

    #[test]
    fn vt_override_disables_allocator() {
        let parsed = parse("vt2");
        assert_eq!(
            parsed.argv,
            vec!["/usr/bin/X", ":0", "vt2"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert_eq!(parsed.display_name, ":0");
        assert!(parsed.vt_override);
    }

    #[test]
    fn append_vt_adds_trailing_token() {
        let mut argv = vec!["/usr/bin/X".to_string(), ":0".to_string()];
        append_vt(&mut argv, 7);
        assert_eq!(argv, vec!["/usr/bin/X", ":0", "vt7"]);
    }

    #[test]
    fn shell_split_respects_quoting() {
        let words = shell_split("/usr/bin/X ':0' -nolisten tcp").unwrap();
        assert_eq!(words, vec!["/usr/bin/X", ":0", "-nolisten", "tcp"]);
    }
}
