use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum FrameKind {
    Request,
    Response,
}

/// One RPC message. Requests carry the command and the encoded arguments;
/// responses echo the request id and carry either the encoded result or the
/// provider's error text.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Envelope {
    pub id: u64,
    pub kind: FrameKind,
    pub command: String,
    pub payload: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl Envelope {
    pub fn request(id: u64, command: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: FrameKind::Request,
            command: command.into(),
            payload: Some(payload),
            error: None,
        }
    }

    /// The response to `request` carrying `outcome`.
    pub fn response_to(request: &Envelope, outcome: Result<Vec<u8>>) -> Self {
        let (payload, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(Error::Remote(message)) => (None, Some(message)),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            id: request.id,
            kind: FrameKind::Response,
            command: request.command.clone(),
            payload,
            error,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<_, 256>(self)
            .map(AlignedVec::into_vec)
            .map_err(|e| Error::Codec(format!("cannot encode frame: {e}")))
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        // archived data must be aligned; frames cut out of a read buffer
        // need not be
        let mut aligned = AlignedVec::with_capacity(frame.len());
        aligned.extend_from_slice(frame);
        rkyv::from_bytes::<Self>(&aligned)
            .map_err(|e| Error::Codec(format!("cannot decode frame: {e}")))
    }
}
