//! Resolution of the jail user and the payload's environment.
//!
//! The jail user must be a real account with a home under `/home` and a
//! login shell the system recognizes. The payload environment is built
//! from a small inherited allowlist plus `NAME=VALUE` overrides given on
//! the command line.

use std::ffi::CString;

use nix::unistd::User;

use crate::paths::shell_quote;
use crate::types::{JailError, Result, ROOT};

const SHELLS_FILE: &str = "/etc/shells";
const DEFAULT_PATH: &str = "PATH=/usr/local/bin:/bin:/usr/bin";

#[derive(Clone, Debug)]
pub struct JailOwner {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub home: String,
    pub shell: String,
}

impl JailOwner {
    pub fn lookup(name: &str) -> Result<Self> {
        if name.len() >= 1024 {
            return Err(JailError::Usage(format!("{}: Username too long", name)));
        }
        let user = User::from_name(name)
            .map_err(|e| JailError::Io(
                name.to_string(),
                std::io::Error::from_raw_os_error(e as i32),
            ))?
            .ok_or_else(|| JailError::Usage(format!("{}: No such user", name)))?;

        let dir = user.dir.to_string_lossy().into_owned();
        let home = if dir == "/" {
            "/home/nobody".to_string()
        } else if dir.starts_with("/home/") {
            dir
        } else {
            return Err(JailError::Usage(format!(
                "{}: Home directory {} not under /home",
                name, dir
            )));
        };

        let shell = user.shell.to_string_lossy().into_owned();
        if shell != "/bin/bash" && shell != "/bin/sh" && !listed_shell(&shell) {
            return Err(JailError::Usage(format!(
                "{}: Shell {} not allowed by {}",
                name, shell, SHELLS_FILE
            )));
        }

        if user.uid.as_raw() == ROOT {
            return Err(JailError::Usage(format!("{}: Jail user cannot be root", name)));
        }

        Ok(Self {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home,
            shell,
        })
    }

    /// Split leading `NAME=VALUE` words off `args`, returning the payload
    /// environment and the remaining command words.
    pub fn build_env<'a>(&self, args: &'a [String]) -> (Vec<String>, &'a [String]) {
        let mut env = Vec::new();
        let mut path = DEFAULT_PATH.to_string();
        let mut lang = "LANG=C".to_string();
        let mut term = None;
        let mut ld_library_path = None;
        for (key, value) in std::env::vars() {
            match key.as_str() {
                "PATH" => path = format!("PATH={}", value),
                "LANG" => lang = format!("LANG={}", value),
                "TERM" => term = Some(format!("TERM={}", value)),
                "LD_LIBRARY_PATH" => {
                    ld_library_path = Some(format!("LD_LIBRARY_PATH={}", value))
                }
                _ => {}
            }
        }
        env.push(path);
        env.push(lang);
        env.extend(term);
        env.extend(ld_library_path);
        env.push(format!("HOME={}", self.home));

        let mut rest = args;
        while let Some(arg) = rest.first() {
            let Some(eq) = arg.find('=') else { break };
            let name = &arg[..eq];
            if name.is_empty()
                || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                break;
            }
            let prefix = &arg[..eq + 1];
            match env.iter_mut().find(|e| e.starts_with(prefix)) {
                Some(slot) => *slot = arg.clone(),
                None => env.push(arg.clone()),
            }
            rest = &rest[1..];
        }
        (env, rest)
    }

    /// Assemble the shell invocation: a login shell, plus `-c COMMAND`
    /// when a command was given.
    pub fn build_argv(&self, command: &[String]) -> Vec<String> {
        let mut argv = vec![self.shell.clone(), "-l".to_string()];
        match command {
            [] => {}
            [single] => {
                argv.push("-c".to_string());
                argv.push(single.clone());
            }
            words => {
                argv.push("-c".to_string());
                let joined: Vec<String> = words.iter().map(|w| shell_quote(w)).collect();
                argv.push(joined.join(" "));
            }
        }
        argv
    }
}

fn listed_shell(shell: &str) -> bool {
    match std::fs::read_to_string(SHELLS_FILE) {
        Ok(contents) => contents
            .lines()
            .map(str::trim)
            .any(|line| !line.starts_with('#') && line == shell),
        Err(_) => false,
    }
}

pub fn to_cstrings(strings: &[String]) -> Result<Vec<CString>> {
    strings
        .iter()
        .map(|s| {
            CString::new(s.as_bytes())
                .map_err(|_| JailError::Usage(format!("{}: embedded NUL", s)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> JailOwner {
        JailOwner {
            uid: 1000,
            gid: 1000,
            home: "/home/alice".to_string(),
            shell: "/bin/sh".to_string(),
        }
    }

    #[test]
    fn env_has_home_and_path() {
        let (env, rest) = owner().build_env(&[]);
        assert!(env.iter().any(|e| e.starts_with("PATH=")));
        assert!(env.iter().any(|e| e.starts_with("LANG=")));
        assert!(env.contains(&"HOME=/home/alice".to_string()));
        assert!(rest.is_empty());
    }

    #[test]
    fn env_overrides_by_prefix() {
        let args = vec![
            "PATH=/jail/bin".to_string(),
            "EXTRA=1".to_string(),
            "/bin/true".to_string(),
        ];
        let (env, rest) = owner().build_env(&args);
        assert!(env.contains(&"PATH=/jail/bin".to_string()));
        assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
        assert!(env.contains(&"EXTRA=1".to_string()));
        assert_eq!(rest, &["/bin/true".to_string()][..]);
    }

    #[test]
    fn env_stops_at_non_assignment() {
        let args = vec!["echo".to_string(), "A=1".to_string()];
        let (env, rest) = owner().build_env(&args);
        assert!(!env.contains(&"A=1".to_string()));
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn env_rejects_odd_names() {
        let args = vec!["A-B=1".to_string()];
        let (_, rest) = owner().build_env(&args);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn argv_login_shell() {
        assert_eq!(owner().build_argv(&[]), vec!["/bin/sh", "-l"]);
    }

    #[test]
    fn argv_single_command_unquoted() {
        let argv = owner().build_argv(&["echo hi".to_string()]);
        assert_eq!(argv, vec!["/bin/sh", "-l", "-c", "echo hi"]);
    }

    #[test]
    fn argv_multi_word_quoted() {
        let argv = owner().build_argv(&[
            "echo".to_string(),
            "hello world".to_string(),
            "it's".to_string(),
        ]);
        assert_eq!(argv[3], "echo 'hello world' 'it'\\''s'");
    }
}
