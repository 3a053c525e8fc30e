//! Core HTTP protocol types.
//!
//! - **Messages** ([`Message`], [`PayloadItem`], [`PayloadSize`]): the frames exchanged between
//!   the codec and the connection
//! - **Request heads** ([`RequestHeader`]): a decoded request without its body
//! - **Responses** ([`ResponseHead`], [`ResponseBody`]): what dispatchers hand back
//! - **Errors** ([`HttpError`], [`ParseError`], [`SendError`], [`PipeliningError`])

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseBody;
pub use response::ResponseHead;
pub use response::empty_response;
pub use response::status_response;

mod error;
pub use error::BoxError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::PipeliningError;
pub use error::SendError;
