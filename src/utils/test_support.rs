/// True when the sandbox forbids binding a loopback socket, so mock-server
/// tests should return early instead of failing.
pub fn loopback_unavailable() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping mock-server test: loopback bind denied");
            true
        }
        Err(err) => panic!("loopback bind failed unexpectedly: {err}"),
    }
}
