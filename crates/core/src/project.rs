use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::OpError;

/// Archives taken right before a restore use this marker in their file name,
/// so project names may not start with it.
pub const RESERVED_PREFIX: &str = "pre-restore-";

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    #[default]
    Mysql,
    #[serde(alias = "mongo")]
    Mongodb,
}

impl DbEngine {
    /// Extension of the single dump file an archive carries.
    pub fn dump_extension(self) -> &'static str {
        match self {
            DbEngine::Mysql => ".sql",
            DbEngine::Mongodb => ".archive",
        }
    }

    pub fn is_dump_file(self, file_name: &str) -> bool {
        file_name.ends_with(self.dump_extension())
    }
}

impl FromStr for DbEngine {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DbEngine::Mysql),
            "mongodb" | "mongo" => Ok(DbEngine::Mongodb),
            other => Err(OpError::Validation(format!("unknown database engine {other:?}"))),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbCredentials {
    #[serde(default)]
    pub engine: DbEngine,
    pub user: String,
    pub password: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("engine", &self.engine)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Where a project's code tree lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocation {
    Local {
        path: String,
    },
    Remote {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        path: String,
    },
}

impl SourceLocation {
    pub fn path(&self) -> &str {
        match self {
            SourceLocation::Local { path } | SourceLocation::Remote { path, .. } => path,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SourceLocation::Remote { .. })
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Local { path } => write!(f, "{path}"),
            SourceLocation::Remote { host, user, port, path } => {
                if let Some(user) = user {
                    write!(f, "{user}@")?;
                }
                write!(f, "{host}")?;
                if let Some(port) = port {
                    write!(f, "#{port}")?;
                }
                write!(f, ":{path}")
            }
        }
    }
}

/// Parses `/srv/app` or `[user@]host[#port]:/srv/app`.
impl FromStr for SourceLocation {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with('/') {
            return Ok(SourceLocation::Local { path: s.to_owned() });
        }
        let (remote, path) = s
            .split_once(':')
            .ok_or_else(|| OpError::Validation(format!("source {s:?} is neither an absolute path nor host:path")))?;
        let (user, host_port) = match remote.split_once('@') {
            Some((user, rest)) => (Some(user.to_owned()), rest),
            None => (None, remote),
        };
        let (host, port) = match host_port.split_once('#') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| OpError::Validation(format!("invalid ssh port {port:?}")))?;
                (host.to_owned(), Some(port))
            }
            None => (host_port.to_owned(), None),
        };
        if host.is_empty() {
            return Err(OpError::Validation(format!("source {s:?} has an empty host")));
        }
        Ok(SourceLocation::Remote {
            host,
            user,
            port,
            path: path.to_owned(),
        })
    }
}

/// Daily wall-clock trigger time, minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn hour(self) -> u32 {
        self.0.hour()
    }

    pub fn minute(self) -> u32 {
        self.0.minute()
    }

    /// First local instant strictly after `now` that falls on this time of day.
    pub fn next_after(self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.0);
        if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        }
    }
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let well_formed = bytes.len() == 5
            && bytes[2] == b':'
            && bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit);
        if !well_formed {
            return Err(OpError::Validation(format!("invalid time {s:?}, expected HH:MM")));
        }
        NaiveTime::parse_from_str(s, "%H:%M")
            .map(Self)
            .map_err(|_| OpError::Validation(format!("invalid time {s:?}, expected HH:MM")))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = OpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// Backup configuration of one project, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: String,
    pub source: SourceLocation,
    pub database: DbCredentials,
    #[serde(default)]
    pub backup_time: TimeOfDay,
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<(), OpError> {
        validate_project_name(&self.name)?;
        let path = self.source.path();
        if path.is_empty() {
            return Err(OpError::Validation("source path is required".into()));
        }
        if !path.starts_with('/') {
            return Err(OpError::Validation(format!("source path {path:?} must be absolute")));
        }
        if let SourceLocation::Remote { host, .. } = &self.source {
            if host.trim().is_empty() {
                return Err(OpError::Validation("remote host is required".into()));
            }
        }
        if self.database.name.trim().is_empty() {
            return Err(OpError::Validation("database name is required".into()));
        }
        if self.database.user.trim().is_empty() {
            return Err(OpError::Validation("database user is required".into()));
        }
        Ok(())
    }
}

pub fn validate_project_name(name: &str) -> Result<(), OpError> {
    if name.is_empty() {
        return Err(OpError::Validation("project name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(OpError::Validation(format!(
            "project name is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if name.starts_with('.') {
        return Err(OpError::Validation("project name may not start with '.'".into()));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(OpError::Validation(format!(
            "project name may not start with {RESERVED_PREFIX:?}"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(OpError::Validation(format!(
            "project name contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn sample() -> ProjectConfig {
        ProjectConfig {
            name: "blog".into(),
            source: SourceLocation::Local { path: "/srv/blog".into() },
            database: DbCredentials {
                engine: DbEngine::Mysql,
                user: "blog".into(),
                password: "hunter2".into(),
                name: "blog".into(),
                host: None,
                port: None,
            },
            backup_time: "14:30".parse().unwrap(),
        }
    }

    #[test]
    fn time_of_day_requires_two_digit_fields() {
        assert!("14:30".parse::<TimeOfDay>().is_ok());
        assert!("00:00".parse::<TimeOfDay>().is_ok());
        for bad in ["9:30", "24:00", "12:60", "1230", "12:3", " 12:30", "ab:cd"] {
            let err = bad.parse::<TimeOfDay>().unwrap_err();
            assert!(matches!(err, OpError::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn next_after_rolls_to_tomorrow_once_passed() {
        let t: TimeOfDay = "14:30".parse().unwrap();
        assert_eq!(t.next_after(at(10, 0, 0)), at(14, 30, 0));
        assert_eq!(t.next_after(at(14, 30, 0)), at(14, 30, 0) + chrono::Duration::days(1));
        assert_eq!(t.next_after(at(23, 59, 59)), at(14, 30, 0) + chrono::Duration::days(1));
    }

    #[test]
    fn parses_remote_sources() {
        let src: SourceLocation = "deploy@web1#2222:/var/www/app".parse().unwrap();
        assert_eq!(
            src,
            SourceLocation::Remote {
                host: "web1".into(),
                user: Some("deploy".into()),
                port: Some(2222),
                path: "/var/www/app".into(),
            }
        );
        assert_eq!(src.to_string(), "deploy@web1#2222:/var/www/app");
        assert!(!"/srv/app".parse::<SourceLocation>().unwrap().is_remote());
        assert!("relative/path".parse::<SourceLocation>().is_err());
    }

    #[test]
    fn validate_rejects_bad_names() {
        let mut cfg = sample();
        assert!(cfg.validate().is_ok());
        for bad in ["", ".hidden", "pre-restore-blog", "has space", "a/b"] {
            cfg.name = bad.into();
            assert!(cfg.validate().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn validate_requires_database_fields_and_absolute_path() {
        let mut cfg = sample();
        cfg.database.name.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.source = SourceLocation::Local { path: "srv/blog".into() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", sample().database);
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn backup_time_defaults_to_midnight() {
        let json = r#"{
            "source": {"kind": "local", "path": "/srv/blog"},
            "database": {"user": "u", "password": "p", "name": "d"}
        }"#;
        let cfg: ProjectConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.backup_time.to_string(), "00:00");
        assert_eq!(cfg.database.engine, DbEngine::Mysql);
    }
}
