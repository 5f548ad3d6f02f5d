//! Quoting and command-line assembly for transports that relay commands
//! through a POSIX shell (`sh -c`, `ssh`, `sudo`).

/// Quote one word for a POSIX shell.
///
/// Words made only of characters no shell interprets (alphanumerics, `-`,
/// `_`, `.`, `/`, `=`) pass through untouched, which keeps relayed command
/// lines readable in trace logs. Anything else is wrapped in single quotes;
/// an embedded single quote closes the quoting, emits an escaped quote, and
/// reopens it, so arbitrary content survives one level of shell evaluation.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty() && word.bytes().all(is_plain) {
        return word.to_string();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for (i, piece) in word.split('\'').enumerate() {
        if i > 0 {
            quoted.push_str("'\\''");
        }
        quoted.push_str(piece);
    }
    quoted.push('\'');
    quoted
}

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'/' | b'=')
}

/// Join an argument vector into one shell-safe command line, quoting each
/// argument individually.
pub fn shell_join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the `sh -c` body that changes into `dir`, resets the environment to
/// exactly `env` (`KEY=VALUE` entries), and exec's `path` with `args`.
///
/// Used wherever a command must be relayed through a shell that does not
/// accept a working directory or environment natively (`ssh`, `sudo`).
pub fn shell_exec_command(dir: &str, env: &[String], path: &str, args: &[String]) -> String {
    let mut cmd = format!("cd {} && exec env -i", shell_quote(dir));
    for kv in env {
        cmd.push(' ');
        cmd.push_str(&shell_quote(kv));
    }
    cmd.push(' ');
    cmd.push_str(&shell_quote(path));
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&shell_quote(arg));
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_stay_readable() {
        // The words the transports actually relay: binary paths, temp file
        // templates, KEY=VALUE environment entries.
        assert_eq!(shell_quote("/usr/bin/uname"), "/usr/bin/uname");
        assert_eq!(shell_quote("resonance_agent.XXXXXXXX"), "resonance_agent.XXXXXXXX");
        assert_eq!(shell_quote("LANG=en_US.UTF-8"), "LANG=en_US.UTF-8");
    }

    #[test]
    fn test_unsafe_words_are_single_quoted() {
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote("a;b|c"), "'a;b|c'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_embedded_single_quotes_survive_one_shell_level() {
        assert_eq!(shell_quote("don't stop"), "'don'\\''t stop'");
        assert_eq!(shell_quote("''"), "''\\'''\\'''");
    }

    #[test]
    fn test_staging_receiver_line() {
        // The bootstrap's upload command: quoting only kicks in when the
        // mktemp path needs it.
        let plain = format!("cat > {}", shell_quote("/tmp/resonance_agent.aB3xK9qZ"));
        assert_eq!(plain, "cat > /tmp/resonance_agent.aB3xK9qZ");

        let awkward = format!("cat > {}", shell_quote("/tmp/odd dir/agent's bin"));
        assert_eq!(awkward, "cat > '/tmp/odd dir/agent'\\''s bin'");
    }

    #[test]
    fn test_join_quotes_each_argument() {
        assert_eq!(
            shell_join(["find", "/var/my dir", "-maxdepth", "1"]),
            "find '/var/my dir' -maxdepth 1"
        );
        assert_eq!(shell_join(["id", "-u"]), "id -u");
    }

    #[test]
    fn test_exec_command_resets_dir_and_env() {
        let env = vec!["PATH=/bin".to_string()];
        let args = vec!["-m".to_string()];
        assert_eq!(
            shell_exec_command("/tmp", &env, "uname", &args),
            "cd /tmp && exec env -i PATH=/bin uname -m"
        );
    }

    #[test]
    fn test_exec_command_quotes_every_part() {
        let env = vec!["GREETING=hello world".to_string()];
        let args = vec!["first arg".to_string()];
        assert_eq!(
            shell_exec_command("/var/my dir", &env, "/opt/my tool", &args),
            "cd '/var/my dir' && exec env -i 'GREETING=hello world' '/opt/my tool' 'first arg'"
        );
    }
}
