use std::fs::File;
use std::os::fd::IntoRawFd;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::*;
use crate::fdutil;
use crate::wire::FileDescriptor;

const CONTENT: &[u8] = b"Content of the file";

#[derive(Debug, Serialize, Deserialize)]
struct OpenFile {
    fd: FileDescriptor,
}

#[test]
fn descriptor_returned_by_a_method_reads_the_original_file() {
    let fixture = Fixture::new();
    let file_path: PathBuf = fixture.dir().join("file.txt");
    std::fs::write(&file_path, CONTENT).expect("prepare file");

    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let served_path = file_path.clone();
    service
        .set_method_handler::<(), OpenFile, _>(1, move |_, (), result| {
            let file = File::open(&served_path).map_err(IpcError::Io)?;
            result.set(OpenFile {
                fd: FileDescriptor::new(file.into()),
            });
            Ok(HandlerExitCode::Success)
        })
        .expect("method 1");

    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    connect_peer(&service, &client);

    let reply: OpenFile = client.call_sync(1, (), TIMEOUT).expect("descriptor reply");

    let raw = reply.fd.into_inner().into_raw_fd();
    let mut buf = [0u8; CONTENT.len()];
    fdutil::read_exact(raw, &mut buf).expect("read through the received fd");
    assert_eq!(&buf, CONTENT);
    let _ = nix::unistd::close(raw);
}
