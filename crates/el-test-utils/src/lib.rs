// el-test-utils: A mock cloud WebSocket server for testing the edge sync client.
//
// Accepts connections on ws://localhost:<port>, answers the edge hello with
// a configurable EdgeConfiguration, records every received frame, and acks
// uplink messages according to a scriptable policy.

pub mod mock_cloud_server;

pub use mock_cloud_server::{AckPolicy, CloudHandle, MockCloudServer, default_edge_configuration};
