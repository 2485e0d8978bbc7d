pub mod fake_docker_daemon;
pub mod mock_sandbox_server;
