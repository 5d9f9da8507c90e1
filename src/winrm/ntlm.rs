//! NTLMv2 message construction for HTTP `Negotiate` authentication.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::ConnectionError;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

/// MsvAvTimestamp attribute id in the challenge target info
const AV_TIMESTAMP: u16 = 7;
const AV_EOL: u16 = 0;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

/// NTLM identity split into user and domain.
#[derive(Clone)]
pub struct NtlmCredentials {
    user: String,
    domain: String,
    password: String,
}

impl NtlmCredentials {
    /// Accepts `DOMAIN\user`, `user@domain` or a bare user name.
    pub fn new(username: &str, password: &str) -> Self {
        let (domain, user) = if let Some((domain, user)) = username.split_once('\\') {
            (domain.to_string(), user.to_string())
        } else if let Some((user, domain)) = username.split_once('@') {
            (domain.to_string(), user.to_string())
        } else {
            (String::new(), username.to_string())
        };

        Self {
            user,
            domain,
            password: password.to_string(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Type 1 message.
    pub fn negotiate_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(32);
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&1u32.to_le_bytes());
        message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        // Empty domain and workstation buffers
        push_security_buffer(&mut message, 0, 32);
        push_security_buffer(&mut message, 0, 32);
        message
    }

    /// Type 3 message answering the server's type 2 `challenge`.
    pub fn authenticate_message(&self, challenge: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let challenge = Challenge::parse(challenge)?;

        let mut client_challenge = [0u8; 8];
        SystemRandom::new()
            .fill(&mut client_challenge)
            .map_err(|_| ConnectionError::AuthenticationFailed("RNG failed".to_string()))?;

        let server_timestamp = challenge.timestamp();
        let timestamp = server_timestamp.unwrap_or_else(filetime_now);

        let key = ntowf_v2(&self.user, &self.domain, &self.password)?;
        let nt_response = nt_v2_response(
            &key,
            &challenge.server_challenge,
            &client_challenge,
            timestamp,
            &challenge.target_info,
        )?;
        // With a server timestamp the LMv2 response must be zeroed
        let lm_response = if server_timestamp.is_some() {
            vec![0u8; 24]
        } else {
            lm_v2_response(&key, &challenge.server_challenge, &client_challenge)?
        };

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.user);
        let workstation: Vec<u8> = Vec::new();

        let header_len = 64u32;
        let lm_offset = header_len;
        let nt_offset = lm_offset + lm_response.len() as u32;
        let domain_offset = nt_offset + nt_response.len() as u32;
        let user_offset = domain_offset + domain.len() as u32;
        let workstation_offset = user_offset + user.len() as u32;
        let session_key_offset = workstation_offset + workstation.len() as u32;

        let flags = (challenge.flags & CLIENT_FLAGS) | NEGOTIATE_UNICODE | NEGOTIATE_NTLM;

        let mut message = Vec::with_capacity(session_key_offset as usize);
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&3u32.to_le_bytes());
        push_security_buffer(&mut message, lm_response.len(), lm_offset);
        push_security_buffer(&mut message, nt_response.len(), nt_offset);
        push_security_buffer(&mut message, domain.len(), domain_offset);
        push_security_buffer(&mut message, user.len(), user_offset);
        push_security_buffer(&mut message, workstation.len(), workstation_offset);
        push_security_buffer(&mut message, 0, session_key_offset);
        message.extend_from_slice(&flags.to_le_bytes());

        message.extend_from_slice(&lm_response);
        message.extend_from_slice(&nt_response);
        message.extend_from_slice(&domain);
        message.extend_from_slice(&user);
        message.extend_from_slice(&workstation);

        Ok(message)
    }
}

impl std::fmt::Debug for NtlmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmCredentials")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Parsed type 2 message.
struct Challenge {
    flags: u32,
    server_challenge: [u8; 8],
    target_info: Vec<u8>,
}

impl Challenge {
    fn parse(data: &[u8]) -> Result<Self, ConnectionError> {
        if data.len() < 32 || &data[..8] != SIGNATURE || read_u32(data, 8) != 2 {
            return Err(ConnectionError::AuthenticationFailed(
                "Invalid NTLM challenge message".to_string(),
            ));
        }

        let flags = read_u32(data, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&data[24..32]);

        let mut target_info = Vec::new();
        if data.len() >= 48 {
            let len = read_u16(data, 40) as usize;
            let offset = read_u32(data, 44) as usize;
            if len > 0 {
                let info = data.get(offset..offset + len).ok_or_else(|| {
                    ConnectionError::AuthenticationFailed(
                        "NTLM challenge target info out of bounds".to_string(),
                    )
                })?;
                target_info = info.to_vec();
            }
        }

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut pos = 0;
        while pos + 4 <= info.len() {
            let id = read_u16(info, pos);
            let len = read_u16(info, pos + 2) as usize;
            if id == AV_EOL {
                break;
            }
            let value = info.get(pos + 4..pos + 4 + len)?;
            if id == AV_TIMESTAMP && len == 8 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(value);
                return Some(u64::from_le_bytes(raw));
            }
            pos += 4 + len;
        }
        None
    }
}

fn push_security_buffer(message: &mut Vec<u8>, len: usize, offset: u32) {
    let len = len as u16;
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&offset.to_le_bytes());
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn filetime_now() -> u64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (secs + FILETIME_EPOCH_OFFSET) * 10_000_000
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], ConnectionError> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|e| ConnectionError::AuthenticationFailed(format!("HMAC-MD5 key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// MD4 of the UTF-16LE password.
fn nt_hash(password: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md4::digest(utf16le(password)));
    out
}

fn ntowf_v2(user: &str, domain: &str, password: &str) -> Result<[u8; 16], ConnectionError> {
    let identity = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity])
}

fn nt_v2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Result<Vec<u8>, ConnectionError> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);

    let proof = hmac_md5(key, &[server_challenge, &blob])?;
    let mut response = proof.to_vec();
    response.extend_from_slice(&blob);
    Ok(response)
}

fn lm_v2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>, ConnectionError> {
    let mut response = hmac_md5(key, &[server_challenge, client_challenge])?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}
