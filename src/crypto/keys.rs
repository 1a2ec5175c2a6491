//! Directional HMAC keys.
//!
//! Both peers hold the same two secrets. Each side signs with
//! `local || peer` and verifies with `peer || local`, so a datagram can never
//! be reflected back at its sender and still authenticate.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::core::{AuthError, MAC_SIZE};

type HmacSha1 = Hmac<Sha1>;

/// Send and receive keys for one connection.
///
/// Key material is zeroized on drop.
#[derive(Clone)]
pub struct PacketKeys {
    send: Zeroizing<Vec<u8>>,
    recv: Zeroizing<Vec<u8>>,
}

impl PacketKeys {
    /// Combine the two pre-negotiated secrets into directional keys.
    pub fn derive(local_secret: &[u8], peer_secret: &[u8]) -> Self {
        let mut send = Zeroizing::new(Vec::with_capacity(local_secret.len() + peer_secret.len()));
        send.extend_from_slice(local_secret);
        send.extend_from_slice(peer_secret);

        let mut recv = Zeroizing::new(Vec::with_capacity(local_secret.len() + peer_secret.len()));
        recv.extend_from_slice(peer_secret);
        recv.extend_from_slice(local_secret);

        Self { send, recv }
    }

    /// Keys as seen by the other side of the connection.
    pub fn reversed(&self) -> Self {
        Self {
            send: self.recv.clone(),
            recv: self.send.clone(),
        }
    }

    /// Append the MAC of `datagram` (under the send key) to it.
    pub fn seal(&self, datagram: &mut Vec<u8>) {
        let tag = self.sign(datagram);
        datagram.extend_from_slice(&tag);
    }

    /// Verify the trailing MAC under the receive key.
    ///
    /// Returns the authenticated prefix (everything before the MAC).
    pub fn open<'a>(&self, datagram: &'a [u8]) -> Result<&'a [u8], AuthError> {
        if datagram.len() <= MAC_SIZE {
            return Err(AuthError::Truncated);
        }
        let (body, tag) = datagram.split_at(datagram.len() - MAC_SIZE);
        let mut mac = keyed(&self.recv);
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| AuthError::InvalidMac)?;
        Ok(body)
    }

    /// Compute the MAC of `data` under the send key.
    pub fn sign(&self, data: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac = keyed(&self.send);
        mac.update(data);
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        tag
    }
}

impl std::fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketKeys").finish_non_exhaustive()
    }
}

fn keyed(key: &[u8]) -> HmacSha1 {
    // HMAC hashes or pads keys of any length; construction cannot fail.
    match <HmacSha1 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}
