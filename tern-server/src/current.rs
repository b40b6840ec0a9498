//! Per-request dispatch information and reply construction.

use bytes::Bytes;
use tern_core::protocol::{finish_message, write_header, MessageType, ReplyStatus};
use tern_core::{
    Context, EncodingVersion, Identity, InputStream, OperationMode, OutputStream, RequestFailed,
    RequestHeader, RpcError,
};

/// What a servant sees of the request it is dispatching.
#[derive(Debug, Clone, Default)]
pub struct Current {
    pub adapter: String,
    pub id: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// Zero for oneway and batched requests.
    pub request_id: i32,
    pub encoding: EncodingVersion,
}

impl Current {
    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    /// Build the response for a dispatch result. `Ok` carries the encoded
    /// return values.
    pub fn create_outgoing_response(&self, result: Result<Bytes, RpcError>) -> OutgoingResponse {
        match result {
            Ok(payload) => {
                let mut body = OutputStream::new();
                body.write_encapsulation_payload(self.encoding, &payload);
                OutgoingResponse {
                    status: ReplyStatus::Ok,
                    body: body.freeze(),
                    error: None,
                }
            }
            Err(err) => self.create_error_response(err),
        }
    }

    fn create_error_response(&self, err: RpcError) -> OutgoingResponse {
        let mut body = OutputStream::new();
        let status = match &err {
            RpcError::ObjectNotExist(rf)
            | RpcError::FacetNotExist(rf)
            | RpcError::OperationNotExist(rf) => {
                let rf = self.fill_request_failed(rf);
                body.write_identity(&rf.identity);
                body.write_facet(&rf.facet);
                body.write_string(&rf.operation);
                match err {
                    RpcError::ObjectNotExist(_) => ReplyStatus::ObjectNotExist,
                    RpcError::FacetNotExist(_) => ReplyStatus::FacetNotExist,
                    _ => ReplyStatus::OperationNotExist,
                }
            }
            RpcError::User(ex) => {
                let mut payload = OutputStream::new();
                payload.write_string(&ex.type_id);
                payload.write_raw(&ex.payload);
                body.write_encapsulation_payload(self.encoding, payload.as_slice());
                ReplyStatus::UserException
            }
            RpcError::UnknownUser(message) => {
                body.write_string(message);
                ReplyStatus::UnknownUserException
            }
            RpcError::UnknownLocal(message) => {
                body.write_string(message);
                ReplyStatus::UnknownLocalException
            }
            RpcError::Unknown(message) => {
                body.write_string(message);
                ReplyStatus::UnknownException
            }
            RpcError::UnknownReplyStatus(_) => {
                body.write_string(&err.to_string());
                ReplyStatus::UnknownException
            }
            local => {
                body.write_string(&format!("{}: {}", local.kind(), local));
                ReplyStatus::UnknownLocalException
            }
        };
        OutgoingResponse {
            status,
            body: body.freeze(),
            error: Some(err),
        }
    }

    /// Missing target fields are taken from the request being dispatched.
    fn fill_request_failed(&self, rf: &RequestFailed) -> RequestFailed {
        RequestFailed {
            identity: if rf.identity.name.is_empty() {
                self.id.clone()
            } else {
                rf.identity.clone()
            },
            facet: if rf.facet.is_empty() {
                self.facet.clone()
            } else {
                rf.facet.clone()
            },
            operation: if rf.operation.is_empty() {
                self.operation.clone()
            } else {
                rf.operation.clone()
            },
        }
    }
}

/// A decoded request ready for dispatch.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub current: Current,
    /// Parameter encapsulation payload, header stripped.
    pub params: Bytes,
}

impl IncomingRequest {
    /// Decode the request header and parameters. The stream is positioned
    /// after the request id (or at the next request of a batch).
    pub fn read(input: &mut InputStream, request_id: i32, adapter: &str) -> Result<Self, RpcError> {
        let header = RequestHeader::read(input)?;
        let (encoding, params) = input.read_encapsulation_payload()?;
        Ok(Self {
            current: Current {
                adapter: adapter.to_string(),
                id: header.identity,
                facet: header.facet,
                operation: header.operation,
                mode: header.mode,
                context: header.context,
                request_id,
                encoding,
            },
            params,
        })
    }

    pub fn new(current: Current, params: impl Into<Bytes>) -> Self {
        Self {
            current,
            params: params.into(),
        }
    }

    pub fn params(&self) -> InputStream {
        InputStream::new(self.params.clone())
    }
}

/// A reply status and its status-specific body.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub status: ReplyStatus,
    pub body: Bytes,
    /// The dispatch failure this response reports, if any.
    pub error: Option<RpcError>,
}

impl OutgoingResponse {
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Size of the reply body, as reported to dispatch observers.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Encode the complete reply message for `request_id`.
    pub fn to_message(&self, request_id: i32) -> Bytes {
        let mut out = OutputStream::with_capacity(self.body.len() + 19);
        write_header(&mut out, MessageType::Reply);
        out.write_int(request_id);
        out.write_byte(self.status as u8);
        out.write_raw(&self.body);
        finish_message(&mut out);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::protocol::read_header;
    use tern_core::version::ENCODING_1_1;
    use tern_core::UserException;

    fn current() -> Current {
        Current {
            adapter: "Adapter".into(),
            id: Identity::named("obj"),
            facet: "f".into(),
            operation: "op".into(),
            request_id: 7,
            encoding: ENCODING_1_1,
            ..Default::default()
        }
    }

    fn status_of(err: RpcError) -> ReplyStatus {
        current().create_outgoing_response(Err(err)).status
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            status_of(RpcError::ObjectNotExist(RequestFailed::default())),
            ReplyStatus::ObjectNotExist
        );
        assert_eq!(
            status_of(RpcError::User(UserException::new("::App::Err", Bytes::new()))),
            ReplyStatus::UserException
        );
        assert_eq!(
            status_of(RpcError::UnknownLocal("x".into())),
            ReplyStatus::UnknownLocalException
        );
        assert_eq!(
            status_of(RpcError::marshal("bad")),
            ReplyStatus::UnknownLocalException
        );
        assert_eq!(
            status_of(RpcError::UnknownUser("::X".into())),
            ReplyStatus::UnknownUserException
        );
        assert_eq!(status_of(RpcError::Unknown("boom".into())), ReplyStatus::UnknownException);
    }

    #[test]
    fn test_request_failed_filled_from_current() {
        let response = current().create_outgoing_response(Err(RpcError::FacetNotExist(
            RequestFailed::default(),
        )));
        let mut input = InputStream::new(response.body.clone());
        assert_eq!(input.read_identity().unwrap(), Identity::named("obj"));
        assert_eq!(input.read_facet().unwrap(), "f");
        assert_eq!(input.read_string().unwrap(), "op");
    }

    #[test]
    fn test_reply_message_layout() {
        let response = current().create_outgoing_response(Ok(Bytes::from_static(&[1, 2, 3])));
        let message = response.to_message(7);
        let mut input = InputStream::new(message.clone());
        let header = read_header(&mut input).unwrap();
        assert_eq!(header.message_type, MessageType::Reply);
        assert_eq!(header.size, message.len());
        assert_eq!(input.read_int().unwrap(), 7);
        assert_eq!(input.read_byte().unwrap(), ReplyStatus::Ok as u8);
        let (encoding, payload) = input.read_encapsulation_payload().unwrap();
        assert_eq!(encoding, ENCODING_1_1);
        assert_eq!(&payload[..], &[1, 2, 3]);
    }
}
