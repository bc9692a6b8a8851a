//! Routing protocol message grammar.
//!
//! Control packets carry a small line-oriented text payload:
//!
//! ```text
//! RPv0
//! type: <hello|hello2u|advert|fadvert>
//! <typed line>
//! ```
//!
//! Typed lines:
//! - `timestamp: <float>` for hello and hello2u
//! - `pathvec: <prefix> <timestamp> <cost> <ip...>` for advert
//! - `linkfail: <ipA> <ipB> <timestamp> <ip...>` for fadvert
//!
//! Floats are printed with three decimals, addresses in dotted-quad form,
//! prefixes as `A.B.C.D/len`, and every line ends with `\n`.
//!
//! Messages are parsed once at ingress into [`ControlMsg`]; handlers match
//! on the variant instead of re-splitting strings.

use crate::addr::{OverlayAddr, Prefix};
use thiserror::Error;

/// Magic first line of every control payload.
pub const MAGIC: &str = "RPv0";

/// Errors from control payload parsing. Every variant is handled by
/// dropping the offending packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("first line is not {MAGIC:?}")]
    BadMagic,

    #[error("second line is not a type line")]
    MissingType,

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("malformed {kind} line")]
    Malformed { kind: &'static str },
}

/// A parsed routing control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMsg {
    /// Neighbor liveness probe.
    Hello { timestamp: f64 },
    /// Echo of a hello, preserving the probe's timestamp.
    HelloReply { timestamp: f64 },
    /// Prefix reachability advertisement.
    Advert {
        prefix: Prefix,
        timestamp: f64,
        cost: f64,
        /// Routers the advertisement has traversed, destination last.
        /// Never empty: the sender always appears at the head.
        path: Vec<OverlayAddr>,
    },
    /// Link-failure advertisement for the adjacency `from -> to`.
    LinkFailure {
        from: OverlayAddr,
        to: OverlayAddr,
        timestamp: f64,
        path: Vec<OverlayAddr>,
    },
}

impl ControlMsg {
    /// Parse a control payload.
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let mut lines = payload.lines();

        if lines.next().map(str::trim) != Some(MAGIC) {
            return Err(ProtocolError::BadMagic);
        }

        let (key, ty) = lines
            .next()
            .and_then(|l| l.split_once(':'))
            .ok_or(ProtocolError::MissingType)?;
        if key.trim() != "type" {
            return Err(ProtocolError::MissingType);
        }

        let body = lines.next().unwrap_or("");
        match ty.trim() {
            "hello" => Ok(ControlMsg::Hello {
                timestamp: parse_timestamp(body)?,
            }),
            "hello2u" => Ok(ControlMsg::HelloReply {
                timestamp: parse_timestamp(body)?,
            }),
            "advert" => parse_advert(body),
            "fadvert" => parse_fadvert(body),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Render the message as a wire payload.
    pub fn to_payload(&self) -> String {
        match self {
            ControlMsg::Hello { timestamp } => {
                format!("{MAGIC}\ntype: hello\ntimestamp: {timestamp:.3}\n")
            }
            ControlMsg::HelloReply { timestamp } => {
                format!("{MAGIC}\ntype: hello2u\ntimestamp: {timestamp:.3}\n")
            }
            ControlMsg::Advert {
                prefix,
                timestamp,
                cost,
                path,
            } => {
                let mut s = format!(
                    "{MAGIC}\ntype: advert\npathvec: {prefix} {timestamp:.3} {cost:.3}"
                );
                for hop in path {
                    s.push(' ');
                    s.push_str(&hop.to_string());
                }
                s.push('\n');
                s
            }
            ControlMsg::LinkFailure {
                from,
                to,
                timestamp,
                path,
            } => {
                let mut s =
                    format!("{MAGIC}\ntype: fadvert\nlinkfail: {from} {to} {timestamp:.3}");
                for hop in path {
                    s.push(' ');
                    s.push_str(&hop.to_string());
                }
                s.push('\n');
                s
            }
        }
    }
}

fn parse_timestamp(line: &str) -> Result<f64, ProtocolError> {
    let malformed = ProtocolError::Malformed { kind: "timestamp" };
    let (key, value) = line.split_once(':').ok_or(malformed.clone())?;
    if key.trim() != "timestamp" {
        return Err(malformed);
    }
    value.trim().parse().map_err(|_| malformed)
}

fn parse_advert(line: &str) -> Result<ControlMsg, ProtocolError> {
    let malformed = ProtocolError::Malformed { kind: "pathvec" };
    let (key, rest) = line.split_once(':').ok_or(malformed.clone())?;
    if key.trim() != "pathvec" {
        return Err(malformed);
    }

    let mut fields = rest.split_whitespace();
    let prefix: Prefix = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(malformed.clone())?;
    let timestamp: f64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(malformed.clone())?;
    let cost: f64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(malformed.clone())?;
    let path = parse_path(fields).ok_or(malformed.clone())?;
    if path.is_empty() {
        return Err(malformed);
    }

    Ok(ControlMsg::Advert {
        prefix,
        timestamp,
        cost,
        path,
    })
}

fn parse_fadvert(line: &str) -> Result<ControlMsg, ProtocolError> {
    let malformed = ProtocolError::Malformed { kind: "linkfail" };
    let (key, rest) = line.split_once(':').ok_or(malformed.clone())?;
    if key.trim() != "linkfail" {
        return Err(malformed);
    }

    let mut fields = rest.split_whitespace();
    let from: OverlayAddr = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(malformed.clone())?;
    let to: OverlayAddr = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(malformed.clone())?;
    let timestamp: f64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(malformed.clone())?;
    let path = parse_path(fields).ok_or(malformed)?;

    Ok(ControlMsg::LinkFailure {
        from,
        to,
        timestamp,
        path,
    })
}

fn parse_path<'a>(fields: impl Iterator<Item = &'a str>) -> Option<Vec<OverlayAddr>> {
    let mut path = Vec::new();
    for field in fields {
        path.push(field.parse().ok()?);
    }
    Some(path)
}
