pub mod mock_filter;
pub mod mock_ll;
pub mod recording_user;

pub use mock_filter::HandshakeFilter;
pub use mock_ll::{MockLowerLayer, OpenMode};
pub use recording_user::RecordingUser;
