/*
[INPUT]:  WebSocket URLs, outbound requests, inbound frames
[OUTPUT]: Connections, request multiplexing and channel dispatch
[POS]:    WebSocket layer - transport and routing
[UPDATE]: When adding new transport or routing features
*/

pub mod connection;
pub mod dispatcher;
pub mod handlers;
pub mod message;
pub mod multiplexer;

pub use connection::{Connection, ConnectionOptions, FrameSender, InboundFrame, Links};
pub use dispatcher::Dispatcher;
pub use handlers::{
    ChannelHandler, HandlerContext, HandlerRegistry, OrderBookHandler, PushHandler, ResyncRequest,
};
pub use message::{ChannelArg, Envelope, OutboundRequest};
pub use multiplexer::{Multiplexer, PendingRequest, RequestCriteria, new_request_id};
