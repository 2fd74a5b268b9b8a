use crate::transport::SipAddr;
use crate::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_until},
    character::complete::{char, multispace0},
    combinator::{map, opt},
    multi::separated_list0,
    sequence::{delimited, preceded},
    IResult, Parser,
};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};

pub trait RsipResponseExt {
    /// The remote target from the Contact header, tolerating the loosely
    /// formatted Contacts some endpoints emit. When the Contact carries an
    /// `ob` parameter the host is replaced with `destination` (RFC 5626
    /// flows go back over the existing connection).
    fn remote_uri(&self, destination: Option<&SipAddr>) -> Result<rsip::Uri>;
}

impl RsipResponseExt for rsip::Response {
    fn remote_uri(&self, destination: Option<&SipAddr>) -> Result<rsip::Uri> {
        let contact = self.contact_header()?;
        let mut uri = match contact.typed() {
            Ok(typed) => typed.uri,
            Err(_) => {
                let mut uri = extract_uri_from_contact(contact.value())?;
                uri.headers.clear();
                uri
            }
        };

        let is_outbound = uri.params.iter().any(|param| {
            matches!(param, rsip::Param::Other(name, _) if name.value().eq_ignore_ascii_case("ob"))
        });
        if is_outbound {
            uri.params.clear();
            if let Some(dest) = destination {
                uri.host_with_port = dest.addr.clone();
                if let Some(transport) = dest.r#type {
                    uri.params.push(rsip::Param::Transport(transport));
                }
            }
        }
        Ok(uri)
    }
}

pub trait RsipHeadersExt {
    fn push_front(&mut self, header: rsip::Header);
}

impl RsipHeadersExt for rsip::Headers {
    fn push_front(&mut self, header: rsip::Header) {
        let mut headers = self.iter().cloned().collect::<Vec<_>>();
        headers.insert(0, header);
        *self = headers.into();
    }
}

/// Remove the first header of the given variant, keeping the rest.
#[macro_export]
macro_rules! header_pop {
    ($iter:expr, $header:path) => {
        let mut first = true;
        $iter.retain(|h| {
            if first && matches!(h, $header(_)) {
                first = false;
                false
            } else {
                true
            }
        });
    };
}

/// Best-effort Contact parsing. Tries rsip's own parser first, then falls
/// back to a forgiving tokenizer for Contacts rsip rejects (unquoted
/// display names, stray parameters).
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    if let Ok(uri) = rsip::headers::Contact::from(line).uri() {
        return Ok(uri);
    }

    let loose = LooseContact::parse(line)?;
    let mut uri = rsip::Uri::try_from(loose.uri).map_err(Error::from)?;
    for (name, value) in &loose.params {
        // transport inside the brackets is already a uri param
        if name.eq_ignore_ascii_case("transport") {
            continue;
        }
        let slot = uri.params.iter_mut().find_map(|param| match param {
            rsip::Param::Other(key, existing) if key.value().eq_ignore_ascii_case(name) => {
                Some(existing)
            }
            _ => None,
        });
        let value = value.map(|v| rsip::param::OtherParamValue::new(v.to_string()));
        match slot {
            Some(existing) => *existing = value,
            None => uri
                .params
                .push(rsip::Param::Other(rsip::param::OtherParam::new(*name), value)),
        }
    }
    Ok(uri)
}

/// Where a request should be sent: the first Route, else the Request-URI
/// (RFC 3261 section 8.1.2).
pub fn destination_from_request(request: &rsip::Request) -> Option<SipAddr> {
    for header in request.headers.iter() {
        if let rsip::Header::Route(route) = header {
            let target = route
                .typed()
                .ok()
                .and_then(|r| r.uris().first().and_then(|u| SipAddr::try_from(&u.uri).ok()));
            if target.is_some() {
                return target;
            }
        }
    }
    SipAddr::try_from(&request.uri).ok()
}

struct LooseContact<'a> {
    uri: &'a str,
    params: Vec<(&'a str, Option<&'a str>)>,
}

impl<'a> LooseContact<'a> {
    fn parse(input: &'a str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::MalformedHeader("empty Contact".to_string()));
        }
        let uri = match angle_bracketed(trimmed) {
            Ok((_, uri)) => uri.trim(),
            Err(_) => trimmed,
        };
        Ok(LooseContact {
            uri,
            params: uri_params(uri),
        })
    }
}

fn angle_bracketed(input: &str) -> IResult<&str, &str> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(take_until("<")).parse(input)?;
    delimited(char('<'), take_until(">"), char('>')).parse(input)
}

fn uri_params(uri: &str) -> Vec<(&str, Option<&str>)> {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    let params_str = match path.split_once(';') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => return Vec::new(),
    };
    match separated_list0(char(';'), one_param).parse(params_str) {
        Ok((_, params)) => params.into_iter().filter(|(name, _)| !name.is_empty()).collect(),
        Err(_) => Vec::new(),
    }
}

fn one_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (input, _) = multispace0(input)?;
    let (input, name) = map(is_not("=; \t\r\n?"), |v: &str| v.trim()).parse(input)?;
    let (input, value) = opt(preceded(
        char('='),
        alt((
            delimited(char('"'), take_until("\""), char('"')),
            map(is_not("; \t\r\n?"), |v: &str| v.trim()),
        )),
    ))
    .parse(input)?;
    Ok((input, (name, value)))
}
