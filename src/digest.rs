use crate::handler::{CredentialState, Credentials};
use crate::utils::{constant_time_eq, QuoteForDigest};
use crate::{Algorithm, Error::*, Qop, Result};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Scheme prefix of a digest `Authorization` header
pub const DIGEST_PREFIX: &str = "Digest ";

/// Split a digest `Authorization` header value into its `key=value` tokens.
///
/// Tokens are returned in the order they appear, with quotes removed and
/// backslash escapes resolved. Commas inside quoted values do not separate tokens.
/// Bare words without `=` are dropped.
///
/// # Errors
/// `MalformedHeader` if the value does not start with `"Digest "` or a quoted
/// value is never closed.
pub fn parse_tokens(header: &str) -> Result<Vec<(String, String)>> {
    let input = match header.strip_prefix(DIGEST_PREFIX) {
        Some(rest) => rest,
        None => return Err(MalformedHeader("not a Digest header".into())),
    };

    #[derive(Debug)]
    #[allow(non_camel_case_types)]
    enum ParserState {
        P_WHITE,
        P_NAME(usize),
        P_VALUE_BEGIN,
        P_VALUE_QUOTED,
        P_VALUE_QUOTED_NEXTLITERAL,
        P_VALUE_PLAIN,
    }

    let mut state = ParserState::P_WHITE;

    let mut parsed = Vec::<(String, String)>::new();
    let mut current_token: Option<String> = None;
    let mut current_value = String::new();

    let mut finish = |token: &mut Option<String>, value: &mut String| {
        if let Some(name) = token.take() {
            parsed.push((name, std::mem::take(value)));
        }
        value.clear();
    };

    for (pos, c) in input.char_indices() {
        match state {
            ParserState::P_WHITE => {
                if c.is_alphabetic() {
                    state = ParserState::P_NAME(pos);
                }
            }
            ParserState::P_NAME(name_start) => match c {
                '=' => {
                    current_token = Some(input[name_start..pos].trim().to_string());
                    state = ParserState::P_VALUE_BEGIN;
                }
                ',' => state = ParserState::P_WHITE,
                _ => {}
            },
            ParserState::P_VALUE_BEGIN => {
                current_value.clear();
                state = match c {
                    '"' => ParserState::P_VALUE_QUOTED,
                    ',' => {
                        finish(&mut current_token, &mut current_value);
                        ParserState::P_WHITE
                    }
                    _ if c.is_ascii_whitespace() => ParserState::P_VALUE_BEGIN,
                    _ => {
                        current_value.push(c);
                        ParserState::P_VALUE_PLAIN
                    }
                };
            }
            ParserState::P_VALUE_QUOTED => match c {
                '"' => {
                    finish(&mut current_token, &mut current_value);
                    state = ParserState::P_WHITE;
                }
                '\\' => state = ParserState::P_VALUE_QUOTED_NEXTLITERAL,
                _ => current_value.push(c),
            },
            ParserState::P_VALUE_PLAIN => {
                if c == ',' || c.is_ascii_whitespace() {
                    finish(&mut current_token, &mut current_value);
                    state = ParserState::P_WHITE;
                } else {
                    current_value.push(c);
                }
            }
            ParserState::P_VALUE_QUOTED_NEXTLITERAL => {
                current_value.push(c);
                state = ParserState::P_VALUE_QUOTED
            }
        }
    }

    match state {
        ParserState::P_VALUE_PLAIN | ParserState::P_VALUE_BEGIN => {
            finish(&mut current_token, &mut current_value);
        }
        ParserState::P_WHITE | ParserState::P_NAME(_) => {}
        _ => {
            return Err(MalformedHeader(format!(
                "unterminated quoted value: {}",
                header
            )))
        }
    }

    Ok(parsed)
}

/// Secret held by the credential storage for a digest account.
#[derive(Clone, PartialEq, Eq)]
pub enum DigestSecret {
    /// The plain password, HA1 is computed on the fly
    Password(String),
    /// Precomputed `H(username:realm:password)`, hex encoded
    Ha1(String),
}

impl fmt::Debug for DigestSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DigestSecret::Password(_) => f.write_str("Password(***)"),
            DigestSecret::Ha1(_) => f.write_str("Ha1(***)"),
        }
    }
}

/// Digest credentials presented by a client in the `Authorization` header.
///
/// Every header field is optional at this stage; what is actually required is checked
/// when the expected response is computed. The method always comes from the request
/// line, a client cannot pick it.
#[derive(Debug, Clone, Default)]
pub struct DigestCredential {
    pub username: Option<String>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub uri: Option<String>,
    /// Client-supplied response hash
    pub response: Option<String>,
    pub qop: Option<String>,
    /// Nonce count, 8 hex digits
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// HTTP method of the request carrying the header
    pub method: String,
    /// Validation status and validated account
    pub state: CredentialState,
}

impl DigestCredential {
    /// Build from parsed header tokens. Unknown tokens are ignored, parameter names
    /// are matched case-insensitively.
    pub fn from_tokens(tokens: &[(String, String)], method: &str) -> Self {
        let mut credential = DigestCredential {
            method: method.to_string(),
            ..Default::default()
        };

        for (name, value) in tokens {
            let value = Some(value.clone());
            match name.to_ascii_lowercase().as_str() {
                "username" => credential.username = value,
                "realm" => credential.realm = value,
                "nonce" => credential.nonce = value,
                "uri" => credential.uri = value,
                "response" => credential.response = value,
                "qop" => credential.qop = value,
                "nc" => credential.nc = value,
                "cnonce" => credential.cnonce = value,
                "opaque" => credential.opaque = value,
                "algorithm" => credential.algorithm = value,
                _ => {}
            }
        }

        credential
    }

    /// Parse an `Authorization` header value and bind the request method.
    pub fn parse(header: &str, method: &str) -> Result<Self> {
        let tokens = parse_tokens(header)?;
        Ok(Self::from_tokens(&tokens, method))
    }

    /// Nonce count as a number, if present
    pub fn nonce_count(&self) -> Result<Option<u32>> {
        match &self.nc {
            Some(nc) => Ok(Some(u32::from_str_radix(nc, 16)?)),
            None => Ok(None),
        }
    }

    /// Hashing algorithm requested by the client, MD5 if not given
    pub fn algorithm(&self) -> Result<Algorithm> {
        match &self.algorithm {
            Some(a) => Algorithm::from_str(a),
            None => Ok(Algorithm::default()),
        }
    }

    fn required<'a>(&self, field: &'a Option<String>, what: &'static str) -> Result<&'a str> {
        field
            .as_deref()
            .ok_or_else(|| MissingRequired(what, self.to_string()))
    }

    /// Compute the response a client knowing `secret` would have sent.
    ///
    /// With qop: `H(HA1:nonce:nc:cnonce:qop:H(method:uri))`,
    /// without: `H(HA1:nonce:H(method:uri))`, `HA1 = H(username:realm:secret)`.
    ///
    /// # Errors
    /// A required field is missing, the algorithm is unknown or the qop is not `auth`.
    pub fn compute_expected_response(&self, secret: &DigestSecret) -> Result<String> {
        let h = self.algorithm()?;
        let username = self.required(&self.username, "username")?;
        let realm = self.required(&self.realm, "realm")?;
        let nonce = self.required(&self.nonce, "nonce")?;
        let uri = self.required(&self.uri, "uri")?;

        let qop = match &self.qop {
            Some(q) => match Qop::from_str(q)? {
                Qop::AUTH => Some(Qop::AUTH),
                // the entity body is not available here
                Qop::AUTH_INT => return Err(BadQop(q.clone())),
            },
            None => None,
        };

        let base_ha1 = match secret {
            DigestSecret::Password(pw) => {
                h.hash_str(&format!("{}:{}:{}", username, realm, pw))
            }
            DigestSecret::Ha1(ha1) => ha1.to_ascii_lowercase(),
        };

        let ha1 = if h.sess {
            let cnonce = self.required(&self.cnonce, "cnonce")?;
            h.hash_str(&format!("{}:{}:{}", base_ha1, nonce, cnonce))
        } else {
            base_ha1
        };

        let ha2 = h.hash_str(&format!("{}:{}", self.method, uri));

        let response = match qop {
            Some(q) => {
                let nc = self.required(&self.nc, "nc")?;
                let cnonce = self.required(&self.cnonce, "cnonce")?;
                h.hash_str(&format!(
                    "{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}",
                    ha1 = ha1,
                    nonce = nonce,
                    nc = nc,
                    cnonce = cnonce,
                    qop = q,
                    ha2 = ha2
                ))
            }
            None => h.hash_str(&format!("{}:{}:{}", ha1, nonce, ha2)),
        };

        Ok(response)
    }

    /// Check the client response against `secret` in constant time.
    /// Anything that prevents computing the expected value counts as a mismatch.
    pub fn matches(&self, secret: &DigestSecret) -> bool {
        let presented = match &self.response {
            Some(r) => r.to_ascii_lowercase(),
            None => return false,
        };

        match self.compute_expected_response(secret) {
            Ok(expected) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
            Err(_) => false,
        }
    }
}

impl Credentials for DigestCredential {
    fn state(&self) -> &CredentialState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut CredentialState {
        &mut self.state
    }
}

impl Display for DigestCredential {
    /// Format as an `Authorization` header value
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("Digest")?;

        let mut sep = " ";
        let quoted = [
            ("username", &self.username),
            ("realm", &self.realm),
            ("nonce", &self.nonce),
            ("uri", &self.uri),
        ];
        for (name, value) in quoted.iter() {
            if let Some(v) = value {
                write!(f, "{}{}=\"{}\"", sep, name, v.quote_for_digest())?;
                sep = ", ";
            }
        }

        if let Some(qop) = &self.qop {
            write!(f, "{}qop={}", sep, qop)?;
            sep = ", ";
        }
        if let Some(nc) = &self.nc {
            write!(f, "{}nc={}", sep, nc)?;
            sep = ", ";
        }
        if let Some(cnonce) = &self.cnonce {
            write!(f, "{}cnonce=\"{}\"", sep, cnonce.quote_for_digest())?;
            sep = ", ";
        }
        if let Some(response) = &self.response {
            write!(f, "{}response=\"{}\"", sep, response.quote_for_digest())?;
            sep = ", ";
        }
        if let Some(opaque) = &self.opaque {
            write!(f, "{}opaque=\"{}\"", sep, opaque.quote_for_digest())?;
            sep = ", ";
        }
        if let Some(algorithm) = &self.algorithm {
            write!(f, "{}algorithm={}", sep, algorithm)?;
        }

        Ok(())
    }
}
