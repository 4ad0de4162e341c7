pub const ECHO_PLANNER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ECHO_PLANNER_BUILD_N: &str = env!("ECHO_PLANNER_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "echo-planner {}\nBuild {}\nProtocol {}\nAcoustic transfer planner",
        ECHO_PLANNER_VERSION,
        ECHO_PLANNER_BUILD_N,
        echo_protocol::PROTOCOL_VERSION
    )
}
