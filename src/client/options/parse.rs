use std::{collections::HashSet, time::Duration};

use percent_encoding::percent_decode_str;
use strsim::jaro_winkler;

use super::{ClientOptions, Credential, ServerAddress, Tls, TlsOptions};
use crate::{
    concern::{Acknowledgment, ReadConcern, WriteConcern},
    error::{Error, Result},
    sdam::MIN_HEARTBEAT_FREQUENCY,
    selection_criteria::ReadPreference,
};

/// Every query option the parser understands, lowercased.
const URI_OPTIONS: &[&str] = &[
    "appname",
    "connecttimeoutms",
    "heartbeatfrequencyms",
    "journal",
    "maxpoolsize",
    "readconcernlevel",
    "readpreference",
    "retryreads",
    "retrywrites",
    "serverselectiontimeoutms",
    "ssl",
    "threadpoolsize",
    "tls",
    "tlsallowinvalidcertificates",
    "tlsallowinvalidhostnames",
    "tlscafile",
    "tlscertificatekeyfile",
    "tlscertificatekeyfilepassword",
    "w",
    "waitqueuetimeoutms",
    "wtimeoutms",
];

/// Unknown options at least this similar to a known one get a suggestion in the error.
const SUGGESTION_THRESHOLD: f64 = 0.84;

const USERINFO_RESERVED: &[char] = &[':', '/', '?', '#', '[', ']', '@'];

const DATABASE_NAME_RESERVED: &[char] = &['/', '\\', ' ', '"', '$'];

/// The structured fields of a parsed connection string, before they are folded into a
/// [`ClientOptions`].
#[derive(Debug, Default)]
pub(super) struct ClientOptionsParser {
    hosts: Vec<ServerAddress>,
    credential: Option<Credential>,
    default_database: Option<String>,
    app_name: Option<String>,
    max_pool_size: Option<u32>,
    thread_pool_size: Option<u32>,
    connect_timeout: Option<Duration>,
    heartbeat_freq: Option<Duration>,
    server_selection_timeout: Option<Duration>,
    wait_queue_timeout: Option<Duration>,
    read_concern: Option<ReadConcern>,
    read_preference: Option<ReadPreference>,
    write_concern: Option<WriteConcern>,
    retry_reads: Option<bool>,
    retry_writes: Option<bool>,
    tls: Option<bool>,
    tls_options: Option<TlsOptions>,
}

impl From<ClientOptionsParser> for ClientOptions {
    fn from(parsed: ClientOptionsParser) -> Self {
        let tls = match (parsed.tls, parsed.tls_options) {
            (Some(false), _) => Some(Tls::Disabled),
            (Some(true), options) => Some(Tls::Enabled(options.unwrap_or_default())),
            (None, options) => options.map(Tls::Enabled),
        };

        ClientOptions {
            hosts: parsed.hosts,
            app_name: parsed.app_name,
            credential: parsed.credential,
            default_database: parsed.default_database,
            max_pool_size: parsed.max_pool_size,
            thread_pool_size: parsed.thread_pool_size,
            heartbeat_freq: parsed.heartbeat_freq,
            connect_timeout: parsed.connect_timeout,
            server_selection_timeout: parsed.server_selection_timeout,
            wait_queue_timeout: parsed.wait_queue_timeout,
            read_concern: parsed.read_concern,
            write_concern: parsed.write_concern,
            read_preference: parsed.read_preference,
            retry_reads: parsed.retry_reads,
            retry_writes: parsed.retry_writes,
            tls,
            ..Default::default()
        }
    }
}

impl ClientOptionsParser {
    /// Parses `mongodb://[userinfo@]host1[,host2...][/[database][?options]]`.
    pub(super) fn parse(uri: &str) -> Result<Self> {
        let rest = strip_scheme(uri)?;

        let (authority, path) = match rest.split_once('/') {
            Some(("", _)) => return Err(Error::invalid_argument("missing hosts")),
            Some((authority, path)) => (authority, Some(path)),
            None if rest.contains('?') => {
                return Err(Error::invalid_argument(
                    "a '/' must separate the hosts from the options",
                ))
            }
            None => (rest, None),
        };

        let (database, query) = match path.map(|p| p.split_once('?')) {
            Some(Some((database, query))) => (non_empty(database), non_empty(query)),
            Some(None) => (path.and_then(non_empty), None),
            None => (None, None),
        };

        // An '@' always introduces userinfo, so the hosts are whatever follows the last one.
        let (userinfo, hosts) = match authority.rsplit_once('@') {
            Some((_, "")) => return Err(Error::invalid_argument("missing hosts")),
            Some((userinfo, hosts)) => (non_empty(userinfo), hosts),
            None => (None, authority),
        };

        let mut parsed = ClientOptionsParser {
            hosts: hosts
                .split(',')
                .map(|host| ServerAddress::parse(decode(host, "host")?))
                .collect::<Result<_>>()?,
            default_database: database.map(parse_database_name).transpose()?,
            ..Default::default()
        };

        if let Some(query) = query {
            parsed.apply_query(query)?;
        }
        if let Some(userinfo) = userinfo {
            let source = parsed.default_database.as_deref().unwrap_or("admin");
            parsed.credential = Some(parse_credential(userinfo, source)?);
        }

        Ok(parsed)
    }

    fn apply_query(&mut self, query: &str) -> Result<()> {
        let mut seen = HashSet::new();
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::invalid_argument(format!(
                    "connection string option {pair:?} is not a `key=value` pair"
                ))
            })?;

            let key = key.to_lowercase();
            if !seen.insert(key.clone()) {
                return Err(Error::invalid_argument(format!(
                    "connection string option {key} is repeated"
                )));
            }
            self.apply_option(&key, &decode(value, "option value")?)?;
        }
        Ok(())
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "appname" => self.app_name = Some(value.to_string()),
            "connecttimeoutms" => self.connect_timeout = Some(parse_millis(key, value)?),
            "heartbeatfrequencyms" => {
                let frequency = parse_millis(key, value)?;
                if frequency < MIN_HEARTBEAT_FREQUENCY {
                    return Err(Error::invalid_argument(format!(
                        "heartbeatFrequencyMS must be at least {}ms, got {}ms",
                        MIN_HEARTBEAT_FREQUENCY.as_millis(),
                        frequency.as_millis()
                    )));
                }
                self.heartbeat_freq = Some(frequency);
            }
            "journal" => self.write_concern().journal = Some(parse_bool(key, value)?),
            "maxpoolsize" => self.max_pool_size = Some(parse_u32(key, value)?),
            "threadpoolsize" => self.thread_pool_size = Some(parse_u32(key, value)?),
            "readconcernlevel" => self.read_concern = Some(ReadConcern::custom(value)),
            "readpreference" => self.read_preference = Some(ReadPreference::from_mode(value)?),
            "retryreads" => self.retry_reads = Some(parse_bool(key, value)?),
            "retrywrites" => self.retry_writes = Some(parse_bool(key, value)?),
            "serverselectiontimeoutms" => {
                self.server_selection_timeout = Some(parse_millis(key, value)?)
            }
            "tls" | "ssl" => {
                let enabled = parse_bool(key, value)?;
                if self.tls.is_some_and(|previous| previous != enabled) {
                    return Err(Error::invalid_argument(
                        "tls and ssl must not be given conflicting values",
                    ));
                }
                self.tls = Some(enabled);
            }
            "tlsallowinvalidcertificates" => {
                self.tls_options().allow_invalid_certificates = Some(parse_bool(key, value)?)
            }
            "tlsallowinvalidhostnames" => {
                self.tls_options().allow_invalid_hostnames = Some(parse_bool(key, value)?)
            }
            "tlscafile" => self.tls_options().ca_file_path = Some(value.to_string()),
            "tlscertificatekeyfile" => {
                self.tls_options().cert_key_file_path = Some(value.to_string())
            }
            "tlscertificatekeyfilepassword" => {
                self.tls_options().cert_key_file_password = Some(value.to_string())
            }
            "w" => self.write_concern().w = Some(parse_acknowledgment(value)?),
            "waitqueuetimeoutms" => self.wait_queue_timeout = Some(parse_millis(key, value)?),
            "wtimeoutms" => self.write_concern().w_timeout = Some(parse_millis(key, value)?),
            unknown => return Err(unknown_option(unknown)),
        }
        Ok(())
    }

    fn write_concern(&mut self) -> &mut WriteConcern {
        self.write_concern.get_or_insert_with(Default::default)
    }

    fn tls_options(&mut self) -> &mut TlsOptions {
        self.tls_options.get_or_insert_with(Default::default)
    }
}

fn strip_scheme(uri: &str) -> Result<&str> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::invalid_argument("connection string has no scheme"))?;
    match scheme {
        "mongodb" => Ok(rest),
        "mongodb+srv" => Err(Error::invalid_argument(
            "mongodb+srv connection strings are not supported",
        )),
        other => Err(Error::invalid_argument(format!(
            "unsupported connection string scheme {other:?}"
        ))),
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

fn decode(s: &str, what: &str) -> Result<String> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::invalid_argument(format!("{what} is not valid percent-encoded UTF-8")))
}

fn parse_database_name(raw: &str) -> Result<String> {
    let name = decode(raw, "database name")?;
    if name.contains(DATABASE_NAME_RESERVED) {
        return Err(Error::invalid_argument(format!(
            "database name {name:?} contains an illegal character"
        )));
    }
    Ok(name)
}

fn parse_credential(userinfo: &str, source: &str) -> Result<Credential> {
    let (username, password) = match userinfo.split_once(':') {
        Some((username, password)) => (username, non_empty(password)),
        None => (userinfo, None),
    };
    if username.is_empty() {
        return Err(Error::invalid_argument("username must not be empty"));
    }

    Ok(Credential {
        username: Some(decode_userinfo(username, "username")?),
        password: password
            .map(|password| decode_userinfo(password, "password"))
            .transpose()?,
        source: Some(source.to_string()),
    })
}

/// Userinfo must percent-encode reserved characters, and every '%' must start a two-digit escape.
fn decode_userinfo(raw: &str, what: &str) -> Result<String> {
    let bad_escape = raw.split('%').skip(1).any(|after| {
        after.len() < 2 || !after.as_bytes()[..2].iter().all(u8::is_ascii_hexdigit)
    });
    if raw.contains(USERINFO_RESERVED) || bad_escape {
        return Err(Error::invalid_argument(format!("{what} must be percent-encoded")));
    }
    decode(raw, what)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::invalid_argument(format!(
            "connection string option {key} must be `true` or `false`, got {value:?}"
        ))),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| {
        Error::invalid_argument(format!(
            "connection string option {key} must be a non-negative integer, got {value:?}"
        ))
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value.parse().map(Duration::from_millis).map_err(|_| {
        Error::invalid_argument(format!(
            "connection string option {key} must be a number of milliseconds, got {value:?}"
        ))
    })
}

fn parse_acknowledgment(value: &str) -> Result<Acknowledgment> {
    match value.parse::<i32>() {
        Ok(nodes) => u32::try_from(nodes).map(Acknowledgment::Nodes).map_err(|_| {
            Error::invalid_argument("connection string option w must not be negative")
        }),
        Err(_) => Ok(Acknowledgment::from(value)),
    }
}

fn unknown_option(key: &str) -> Error {
    let closest = URI_OPTIONS
        .iter()
        .map(|known| (jaro_winkler(known, key), *known))
        .max_by(|a, b| a.0.total_cmp(&b.0));

    let mut message = format!("{key} is an invalid option");
    if let Some((_, known)) = closest.filter(|(score, _)| *score >= SUGGESTION_THRESHOLD) {
        message.push_str(&format!(". An option with a similar name exists: {known}"));
    }
    Error::invalid_argument(message)
}
