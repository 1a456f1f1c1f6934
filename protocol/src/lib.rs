//! Shared data types for the drydock sandbox: capture records, session
//! states, approval and result payloads, and the framed-channel tag
//! alphabet. Everything here is plain data — no I/O — so the supervisor,
//! the approval engine, and the RPC server all agree on one vocabulary.

mod capture;
mod session;
mod state;
pub mod wire;

pub use capture::Capture;
pub use capture::CaptureKind;
pub use capture::CaptureRecord;
pub use session::ApprovalRecord;
pub use session::Decision;
pub use session::OpDecision;
pub use session::OpDisposition;
pub use session::OpOutcome;
pub use session::SessionMetadata;
pub use session::SessionResult;
pub use state::SessionState;

pub mod b64 {
    //! Serde adapters that keep raw byte payloads JSON-safe. All persisted
    //! byte fields (script writes, stdin, stdout/stderr) go through standard
    //! base64 rather than lossy UTF-8.

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }

    pub mod opt {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD;
        use serde::Deserialize;
        use serde::Deserializer;
        use serde::Serializer;
        use serde::de::Error as _;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(encoded) => STANDARD.decode(encoded).map(Some).map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }
}
