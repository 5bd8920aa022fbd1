//! Typed operation boundary
//!
//! Generated interface stubs describe each remote procedure by implementing
//! [`Operation`]; [`RpcClient::call`](crate::RpcClient::call) then encodes
//! the request, invokes the opnum and decodes the typed response.

use msrpc_ndr::{NdrReader, NdrWriter};

/// One remote procedure of an interface
pub trait Operation {
    /// Operation number within the bound interface
    const OPNUM: u16;

    /// Name used in logs
    const NAME: &'static str;

    /// The `[in]` parameters
    type Request;

    /// The `[out]` parameters and return value
    type Response;

    /// Encode the `[in]` parameters in declaration order, one
    /// [`NdrWriter::write_param`] per parameter so each one's referents
    /// follow it.
    fn encode_request<'a>(
        request: &'a Self::Request,
        w: &mut NdrWriter<'a>,
    ) -> msrpc_ndr::Result<()>;

    /// Decode the `[out]` parameters, one [`NdrReader::read_param`] per
    /// parameter
    fn decode_response(r: &mut NdrReader) -> msrpc_ndr::Result<Self::Response>;

    /// Status carried by the response (usually the trailing return value).
    ///
    /// A non-zero status fails the call with
    /// [`RpcError::RemoteFault`](crate::RpcError::RemoteFault).
    fn status(_response: &Self::Response) -> u32 {
        0
    }
}
