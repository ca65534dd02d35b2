//! Functional command strings.
//!
//! Operators drive one-shot radio actions with a small call syntax, e.g.
//! `send_advert(True)` or `send_msg("aabbccddeeff", "hello")`. Only
//! literal arguments are accepted: booleans, integers, floats, quoted
//! strings, byte strings and `name=value` keywords. There is no expression
//! evaluation of any kind; `cmd(1+2)` simply fails to parse, which keeps
//! the surface injection-safe.
//!
//! Parsing and dispatch are separate: [`parse`] yields a name plus literal
//! values, and [`Command::from_parsed`] maps that onto the closed set of
//! supported commands with arity and type checking.

use std::fmt;

use anyhow::{anyhow, bail, Result};

use crate::coordinator::registry::ContactRegistry;
use crate::meshcore::api::MeshApi;
use crate::meshcore::Contact;

/// Minimum pubkey-prefix length accepted when resolving a contact.
const MIN_PREFIX_LEN: usize = 6;

/// A literal argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A parsed call: name, positional literals, keyword literals.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

/// Parse `name(arg, ..., key=value, ...)`. Returns `None` for anything
/// that is not a plain call with literal arguments.
pub fn parse(input: &str) -> Option<ParsedCommand> {
    let input = input.trim();
    let open = input.find('(')?;
    let name = &input[..open];
    if !is_ident(name) {
        return None;
    }
    if !input.ends_with(')') {
        return None;
    }
    let body = &input[open + 1..input.len() - 1];

    let mut args = Vec::new();
    let mut kwargs = Vec::new();
    for part in split_args(body)? {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        match split_kwarg(part) {
            Some((key, value_src)) => {
                kwargs.push((key.to_string(), parse_literal(value_src.trim())?));
            }
            None => {
                // Positional arguments may not follow keywords.
                if !kwargs.is_empty() {
                    return None;
                }
                args.push(parse_literal(part)?);
            }
        }
    }
    Some(ParsedCommand {
        name: name.to_string(),
        args,
        kwargs,
    })
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split the argument body on top-level commas, honoring quotes.
fn split_args(body: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for ch in body.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                ',' => {
                    parts.push(std::mem::take(&mut current));
                }
                '(' | ')' => return None,
                _ => current.push(ch),
            },
        }
    }
    if quote.is_some() {
        return None;
    }
    if !current.trim().is_empty() || !parts.is_empty() {
        if current.trim().is_empty() && !parts.is_empty() {
            // Trailing comma.
            return None;
        }
        parts.push(current);
    }
    Some(parts)
}

/// Split `key=value` at a top-level `=`, rejecting non-identifier keys.
fn split_kwarg(part: &str) -> Option<(&str, &str)> {
    if part.starts_with('\'') || part.starts_with('"') || part.starts_with("b\"") || part.starts_with("b'") {
        return None;
    }
    let eq = part.find('=')?;
    let key = part[..eq].trim();
    if is_ident(key) {
        Some((key, &part[eq + 1..]))
    } else {
        None
    }
}

fn parse_literal(src: &str) -> Option<Value> {
    match src {
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Some(rest) = src.strip_prefix('b') {
        if (rest.starts_with('"') && rest.ends_with('"') && rest.len() >= 2)
            || (rest.starts_with('\'') && rest.ends_with('\'') && rest.len() >= 2)
        {
            return unescape(&rest[1..rest.len() - 1]).map(Value::Bytes);
        }
        return None;
    }
    if (src.starts_with('"') && src.ends_with('"') && src.len() >= 2)
        || (src.starts_with('\'') && src.ends_with('\'') && src.len() >= 2)
    {
        let bytes = unescape(&src[1..src.len() - 1])?;
        return String::from_utf8(bytes).ok().map(Value::Str);
    }
    if let Ok(i) = src.parse::<i64>() {
        return Some(Value::Int(i));
    }
    // Floats must look like numbers, not arbitrary expressions.
    if src
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        if let Ok(x) = src.parse::<f64>() {
            return Some(Value::Float(x));
        }
    }
    None
}

/// Process `\n`, `\r`, `\t`, `\\`, `\'`, `\"`, `\0` and `\xNN` escapes.
fn unescape(src: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut chars = src.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            '0' => out.push(0),
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            'x' => {
                let hi = chars.next()?;
                let lo = chars.next()?;
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
                out.push(byte);
            }
            _ => return None,
        }
    }
    Some(out)
}

/// How a command names its target node: by pubkey prefix or advertised name.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRef(pub String);

/// The closed set of supported commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reboot,
    SendAdvert { flood: bool },
    SetName { name: String },
    SetCoords { lat: f64, lon: f64 },
    SetTxPower { dbm: u8 },
    SetRadioParams { freq_khz: u32, bw_hz: u32, sf: u8, cr: u8 },
    SyncTime,
    GetBattery,
    SendMsg { contact: ContactRef, text: String },
    SendChanMsg { channel_idx: u8, text: String },
    SendLogin { contact: ContactRef, password: String },
    SendLogout { contact: ContactRef },
    ResetPath { contact: ContactRef },
    RemoveContact { contact: ContactRef },
    AddContact { contact: ContactRef },
    SetChannel { channel_idx: u8, name: String, secret: Vec<u8> },
}

struct Args {
    name: String,
    values: Vec<Value>,
}

impl Args {
    /// Flatten positionals plus kwargs in declared parameter order.
    fn collect(parsed: ParsedCommand, params: &[&str]) -> Result<Self> {
        let mut values: Vec<Option<Value>> = vec![None; params.len()];
        if parsed.args.len() > params.len() {
            bail!("{} takes at most {} arguments", parsed.name, params.len());
        }
        for (i, v) in parsed.args.into_iter().enumerate() {
            values[i] = Some(v);
        }
        for (key, v) in parsed.kwargs {
            let idx = params
                .iter()
                .position(|p| *p == key)
                .ok_or_else(|| anyhow!("{}: unknown parameter {key}", parsed.name))?;
            if values[idx].is_some() {
                bail!("{}: parameter {key} given twice", parsed.name);
            }
            values[idx] = Some(v);
        }
        // A filled slot after a gap would shift into the wrong position.
        let filled = values.iter().take_while(|v| v.is_some()).count();
        if values[filled..].iter().any(|v| v.is_some()) {
            bail!("{}: missing an earlier parameter", parsed.name);
        }
        Ok(Self {
            name: parsed.name,
            values: values.into_iter().flatten().collect(),
        })
    }

    fn take(&mut self, what: &str) -> Result<Value> {
        if self.values.is_empty() {
            bail!("{}: missing {what}", self.name);
        }
        Ok(self.values.remove(0))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        match self.take(what)? {
            Value::Str(s) => Ok(s),
            other => bail!("{}: {what} must be a string, got {other}", self.name),
        }
    }

    fn bool_or(&mut self, default: bool) -> Result<bool> {
        if self.values.is_empty() {
            return Ok(default);
        }
        match self.values.remove(0) {
            Value::Bool(b) => Ok(b),
            other => bail!("{}: expected a boolean, got {other}", self.name),
        }
    }

    fn number(&mut self, what: &str) -> Result<f64> {
        match self.take(what)? {
            Value::Int(i) => Ok(i as f64),
            Value::Float(x) => Ok(x),
            other => bail!("{}: {what} must be a number, got {other}", self.name),
        }
    }

    fn uint<T: TryFrom<i64>>(&mut self, what: &str) -> Result<T> {
        match self.take(what)? {
            Value::Int(i) => {
                T::try_from(i).map_err(|_| anyhow!("{}: {what} out of range", self.name))
            }
            other => bail!("{}: {what} must be an integer, got {other}", self.name),
        }
    }

    fn bytes_or_hex(&mut self, what: &str) -> Result<Vec<u8>> {
        match self.take(what)? {
            Value::Bytes(b) => Ok(b),
            Value::Str(s) => crate::meshcore::protocol::hex_decode(&s)
                .map_err(|_| anyhow!("{}: {what} must be hex or a byte string", self.name)),
            other => bail!("{}: {what} must be bytes, got {other}", self.name),
        }
    }

    fn done(self) -> Result<()> {
        if self.values.is_empty() {
            Ok(())
        } else {
            bail!("{}: too many arguments", self.name)
        }
    }
}

impl Command {
    /// Map a parsed call onto a supported command, validating arity and
    /// argument types.
    pub fn from_parsed(parsed: ParsedCommand) -> Result<Self> {
        let name = parsed.name.clone();
        match name.as_str() {
            "reboot" => {
                Args::collect(parsed, &[])?.done()?;
                Ok(Command::Reboot)
            }
            "send_advert" => {
                let mut a = Args::collect(parsed, &["flood"])?;
                let flood = a.bool_or(false)?;
                a.done()?;
                Ok(Command::SendAdvert { flood })
            }
            "set_name" => {
                let mut a = Args::collect(parsed, &["name"])?;
                let name = a.string("name")?;
                a.done()?;
                Ok(Command::SetName { name })
            }
            "set_coords" => {
                let mut a = Args::collect(parsed, &["lat", "lon"])?;
                let lat = a.number("lat")?;
                let lon = a.number("lon")?;
                a.done()?;
                Ok(Command::SetCoords { lat, lon })
            }
            "set_tx_power" => {
                let mut a = Args::collect(parsed, &["dbm"])?;
                let dbm = a.uint("dbm")?;
                a.done()?;
                Ok(Command::SetTxPower { dbm })
            }
            "set_radio_params" => {
                let mut a = Args::collect(parsed, &["freq_khz", "bw_hz", "sf", "cr"])?;
                let freq_khz = a.uint("freq_khz")?;
                let bw_hz = a.uint("bw_hz")?;
                let sf = a.uint("sf")?;
                let cr = a.uint("cr")?;
                a.done()?;
                Ok(Command::SetRadioParams {
                    freq_khz,
                    bw_hz,
                    sf,
                    cr,
                })
            }
            "sync_time" => {
                Args::collect(parsed, &[])?.done()?;
                Ok(Command::SyncTime)
            }
            "get_battery" => {
                Args::collect(parsed, &[])?.done()?;
                Ok(Command::GetBattery)
            }
            "send_msg" => {
                let mut a = Args::collect(parsed, &["contact", "text"])?;
                let contact = ContactRef(a.string("contact")?);
                let text = a.string("text")?;
                a.done()?;
                Ok(Command::SendMsg { contact, text })
            }
            "send_chan_msg" => {
                let mut a = Args::collect(parsed, &["channel_idx", "text"])?;
                let channel_idx = a.uint("channel_idx")?;
                let text = a.string("text")?;
                a.done()?;
                Ok(Command::SendChanMsg { channel_idx, text })
            }
            "send_login" => {
                let mut a = Args::collect(parsed, &["contact", "password"])?;
                let contact = ContactRef(a.string("contact")?);
                let password = a.string("password")?;
                a.done()?;
                Ok(Command::SendLogin { contact, password })
            }
            "send_logout" => {
                let mut a = Args::collect(parsed, &["contact"])?;
                let contact = ContactRef(a.string("contact")?);
                a.done()?;
                Ok(Command::SendLogout { contact })
            }
            "reset_path" => {
                let mut a = Args::collect(parsed, &["contact"])?;
                let contact = ContactRef(a.string("contact")?);
                a.done()?;
                Ok(Command::ResetPath { contact })
            }
            "remove_contact" => {
                let mut a = Args::collect(parsed, &["contact"])?;
                let contact = ContactRef(a.string("contact")?);
                a.done()?;
                Ok(Command::RemoveContact { contact })
            }
            "add_contact" => {
                let mut a = Args::collect(parsed, &["contact"])?;
                let contact = ContactRef(a.string("contact")?);
                a.done()?;
                Ok(Command::AddContact { contact })
            }
            "set_channel" => {
                let mut a = Args::collect(parsed, &["channel_idx", "name", "secret"])?;
                let channel_idx = a.uint("channel_idx")?;
                let name = a.string("name")?;
                let secret = a.bytes_or_hex("secret")?;
                a.done()?;
                Ok(Command::SetChannel {
                    channel_idx,
                    name,
                    secret,
                })
            }
            _ => bail!("unknown command {name}"),
        }
    }
}

/// Resolve a contact reference against the radio's own contact table:
/// pubkey prefix first (at least 6 hex chars), then exact advertised name.
/// For `add_contact` only, the discovered store is also consulted, since
/// the whole point is that the node is not in the radio's table yet.
pub fn resolve_contact(
    registry: &ContactRegistry,
    reference: &ContactRef,
    include_discovered: bool,
) -> Result<Contact> {
    let r = &reference.0;
    if r.len() >= MIN_PREFIX_LEN && r.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Some(contact) = registry.get_added_by_prefix(&r.to_lowercase()) {
            return Ok(contact);
        }
    }
    if let Some(contact) = registry.get_added_by_name(r) {
        return Ok(contact);
    }
    if include_discovered {
        if let Some(contact) = registry.get_discovered_by_prefix(&r.to_lowercase()) {
            return Ok(contact);
        }
    }
    bail!("no contact matching {r:?}")
}

/// Parse and run one command string against the radio.
pub async fn execute(
    input: &str,
    api: &dyn MeshApi,
    registry: &std::sync::Mutex<ContactRegistry>,
) -> Result<String> {
    let parsed = parse(input).ok_or_else(|| anyhow!("invalid command syntax: {input:?}"))?;
    let command = Command::from_parsed(parsed)?;

    let resolve = |r: &ContactRef, discovered: bool| -> Result<Contact> {
        let registry = registry.lock().expect("registry mutex poisoned");
        resolve_contact(&registry, r, discovered)
    };

    match command {
        Command::Reboot => {
            api.reboot().await?;
            Ok("reboot sent".into())
        }
        Command::SendAdvert { flood } => {
            api.send_advert(flood).await?;
            Ok(format!("advert sent (flood={flood})"))
        }
        Command::SetName { name } => {
            api.set_name(&name).await?;
            Ok(format!("name set to {name:?}"))
        }
        Command::SetCoords { lat, lon } => {
            api.set_coords(lat, lon).await?;
            Ok(format!("coords set to {lat:.6},{lon:.6}"))
        }
        Command::SetTxPower { dbm } => {
            api.set_tx_power(dbm).await?;
            Ok(format!("tx power set to {dbm}dBm"))
        }
        Command::SetRadioParams {
            freq_khz,
            bw_hz,
            sf,
            cr,
        } => {
            api.set_radio_params(freq_khz, bw_hz, sf, cr).await?;
            Ok("radio params set".into())
        }
        Command::SyncTime => {
            let epoch = chrono::Utc::now().timestamp().max(0) as u32;
            api.set_time(epoch).await?;
            Ok(format!("radio clock set to {epoch}"))
        }
        Command::GetBattery => {
            let mv = api.get_battery().await?;
            Ok(format!("battery: {mv}mV"))
        }
        Command::SendMsg { contact, text } => {
            let contact = resolve(&contact, false)?;
            api.send_msg(&contact, &text).await?;
            Ok(format!("message sent to {}", contact.key_prefix()))
        }
        Command::SendChanMsg { channel_idx, text } => {
            api.send_chan_msg(channel_idx, &text).await?;
            Ok(format!("message sent on channel {channel_idx}"))
        }
        Command::SendLogin { contact, password } => {
            let contact = resolve(&contact, false)?;
            api.send_login(&contact, &password).await?;
            Ok(format!("login sent to {}", contact.key_prefix()))
        }
        Command::SendLogout { contact } => {
            let contact = resolve(&contact, false)?;
            api.send_logout(&contact).await?;
            Ok(format!("logout sent to {}", contact.key_prefix()))
        }
        Command::ResetPath { contact } => {
            let contact = resolve(&contact, false)?;
            api.reset_path(&contact).await?;
            Ok(format!("path reset for {}", contact.key_prefix()))
        }
        Command::RemoveContact { contact } => {
            let contact = resolve(&contact, false)?;
            api.remove_contact(&contact).await?;
            Ok(format!("removed {}", contact.key_prefix()))
        }
        Command::AddContact { contact } => {
            let contact = resolve(&contact, true)?;
            api.add_update_contact(&contact).await?;
            Ok(format!("added {}", contact.key_prefix()))
        }
        Command::SetChannel {
            channel_idx,
            name,
            secret,
        } => {
            if secret.len() != 16 {
                bail!("set_channel: secret must be 16 bytes");
            }
            api.set_channel(channel_idx, &name, &secret).await?;
            Ok(format!("channel {channel_idx} set"))
        }
    }
}
