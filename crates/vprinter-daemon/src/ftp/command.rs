//! Control-channel command parsing.

/// A parsed control-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Pasv,
    Epsv,
    Stor(String),
    Pwd,
    Cwd(String),
    Cdup,
    Mkd(String),
    List,
    Nlst,
    Size(String),
    Type(String),
    Pbsz(String),
    Prot(String),
    Syst,
    Feat,
    Opts(String),
    Dele(String),
    Abor,
    Auth(String),
    Noop,
    Quit,
    Unknown(String),
}

impl Command {
    /// Parse one line, without its line ending.
    ///
    /// Verbs are case-insensitive; the argument is everything after the
    /// first space, untrimmed on the left only so file names keep their
    /// trailing spaces.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim_start().to_string()),
            None => (line, String::new()),
        };

        match verb.to_ascii_uppercase().as_str() {
            "USER" => Self::User(arg),
            "PASS" => Self::Pass(arg),
            "PASV" => Self::Pasv,
            "EPSV" => Self::Epsv,
            "STOR" => Self::Stor(arg),
            "PWD" | "XPWD" => Self::Pwd,
            "CWD" | "XCWD" => Self::Cwd(arg),
            "CDUP" | "XCUP" => Self::Cdup,
            "MKD" | "XMKD" => Self::Mkd(arg),
            "LIST" => Self::List,
            "NLST" => Self::Nlst,
            "SIZE" => Self::Size(arg),
            "TYPE" => Self::Type(arg),
            "PBSZ" => Self::Pbsz(arg),
            "PROT" => Self::Prot(arg),
            "SYST" => Self::Syst,
            "FEAT" => Self::Feat,
            "OPTS" => Self::Opts(arg),
            "DELE" => Self::Dele(arg),
            "ABOR" => Self::Abor,
            "AUTH" => Self::Auth(arg),
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            _ => Self::Unknown(verb.to_string()),
        }
    }

    /// Whether the command is refused before login.
    pub const fn requires_login(&self) -> bool {
        !matches!(
            self,
            Self::User(_)
                | Self::Pass(_)
                | Self::Pbsz(_)
                | Self::Prot(_)
                | Self::Syst
                | Self::Feat
                | Self::Opts(_)
                | Self::Auth(_)
                | Self::Noop
                | Self::Quit
                | Self::Unknown(_)
        )
    }

    /// Verb for logging; never includes the password.
    pub fn verb(&self) -> &str {
        match self {
            Self::User(_) => "USER",
            Self::Pass(_) => "PASS",
            Self::Pasv => "PASV",
            Self::Epsv => "EPSV",
            Self::Stor(_) => "STOR",
            Self::Pwd => "PWD",
            Self::Cwd(_) => "CWD",
            Self::Cdup => "CDUP",
            Self::Mkd(_) => "MKD",
            Self::List => "LIST",
            Self::Nlst => "NLST",
            Self::Size(_) => "SIZE",
            Self::Type(_) => "TYPE",
            Self::Pbsz(_) => "PBSZ",
            Self::Prot(_) => "PROT",
            Self::Syst => "SYST",
            Self::Feat => "FEAT",
            Self::Opts(_) => "OPTS",
            Self::Dele(_) => "DELE",
            Self::Abor => "ABOR",
            Self::Auth(_) => "AUTH",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Unknown(verb) => verb,
        }
    }
}

/// Base name of an upload path, with every directory component removed.
///
/// Both separators are stripped since slicers on Windows send backslashes.
/// Returns `None` for names that reduce to nothing or to a dot entry.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_matches(char::from(0));
    match name {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbs_case_insensitively() {
        assert_eq!(Command::parse("user bblp\r\n"), Command::User("bblp".into()));
        assert_eq!(Command::parse("PASS 12345678"), Command::Pass("12345678".into()));
        assert_eq!(Command::parse("epsv"), Command::Epsv);
        assert_eq!(Command::parse("PROT P"), Command::Prot("P".into()));
        assert_eq!(Command::parse("XPWD"), Command::Pwd);
        assert_eq!(Command::parse("SITE CHMOD"), Command::Unknown("SITE".into()));
    }

    #[test]
    fn stor_keeps_spaces_in_names() {
        assert_eq!(
            Command::parse("STOR /cache/My Part v2.3mf\r\n"),
            Command::Stor("/cache/My Part v2.3mf".into())
        );
    }

    #[test]
    fn login_gate() {
        for cmd in ["STOR a", "LIST", "PWD", "PASV", "EPSV", "CWD /", "TYPE I", "SIZE x"] {
            assert!(Command::parse(cmd).requires_login(), "{cmd}");
        }
        for cmd in ["USER bblp", "PASS x", "QUIT", "FEAT", "SYST", "PBSZ 0", "PROT P"] {
            assert!(!Command::parse(cmd).requires_login(), "{cmd}");
        }
    }

    #[test]
    fn password_never_in_verb() {
        assert_eq!(Command::parse("PASS secret").verb(), "PASS");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename("/cache/job.3mf").unwrap(), "job.3mf");
        assert_eq!(sanitize_filename("..\\..\\evil.3mf").unwrap(), "evil.3mf");
        assert_eq!(sanitize_filename("plain.gcode").unwrap(), "plain.gcode");
        assert!(sanitize_filename("/cache/").is_none());
        assert!(sanitize_filename("..").is_none());
        assert!(sanitize_filename("").is_none());
    }
}
