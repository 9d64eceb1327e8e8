//! Background digest worker
//!
//! Requests and responses cross the thread boundary over `flume` channels.
//! A request owns its byte handle; once sent, the caller no longer holds it.

use std::panic::AssertUnwindSafe;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use uuid::Uuid;

/// Number of hex characters kept from the SHA-256 digest
pub const FINGERPRINT_LEN: usize = 10;

/// Work item sent to the worker
#[derive(Debug)]
pub struct HashRequest {
    pub id: Uuid,
    pub data: Bytes,
}

/// Reply from the worker, correlated by `id`
#[derive(Debug)]
pub struct HashResponse {
    pub id: Uuid,
    pub result: Result<String, String>,
}

/// SHA-256 of `data`, lowercase hex, truncated to [`FINGERPRINT_LEN`] characters
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Spawn the digest thread. It exits when the request channel closes.
pub fn spawn(
    requests: flume::Receiver<HashRequest>,
    responses: flume::Sender<HashResponse>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("imghost-hash-worker".to_string())
        .spawn(move || {
            debug!("Hash worker started");
            for HashRequest { id, data } in requests.iter() {
                trace!(%id, bytes = data.len(), "digesting");
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| fingerprint(&data)))
                    .map_err(|_| "hash calculation failed".to_string());

                if responses.send(HashResponse { id, result }).is_err() {
                    break;
                }
            }
            debug!("Hash worker stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_known_vector() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
        assert_eq!(fingerprint(b"abc"), "ba7816bf8f");
        assert_eq!(fingerprint(b"").len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_worker_answers_with_matching_id() {
        let (req_tx, req_rx) = flume::unbounded();
        let (resp_tx, resp_rx) = flume::unbounded();
        let handle = spawn(req_rx, resp_tx).unwrap();

        let id = Uuid::new_v4();
        req_tx
            .send(HashRequest {
                id,
                data: Bytes::from_static(b"abc"),
            })
            .unwrap();

        let response = resp_rx.recv().unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.result, Ok("ba7816bf8f".to_string()));

        drop(req_tx);
        handle.join().unwrap();
    }
}
