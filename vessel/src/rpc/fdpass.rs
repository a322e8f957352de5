//! SCM_RIGHTS descriptor transfers.
//!
//! The fd-passing socket carries no protocol of its own: every message is a
//! single null byte with the descriptors in ancillary data. Ordering is
//! carried by the main RPC channel (a reply announcing N descriptors is
//! always written after the descriptors are sent here).

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg,
};

use vessel_shared::errors::{VesselError, VesselResult};

/// Maximum descriptors per transfer; matches the largest legitimate batch
/// (image fds plus /dev/fuse fds plus the userns handle).
pub const MAX_FDS: usize = 32;

pub fn send_fds(socket: &UnixStream, fds: &[RawFd]) -> VesselResult<()> {
    if fds.is_empty() || fds.len() > MAX_FDS {
        return Err(VesselError::Setup(format!(
            "refusing to send {} descriptors",
            fds.len()
        )));
    }

    let payload = [0u8];
    let iov = [IoSlice::new(&payload)];
    let cmsg = [ControlMessage::ScmRights(fds)];

    sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| VesselError::Setup(format!("sendmsg(SCM_RIGHTS): {e}")))?;
    Ok(())
}

pub fn recv_fds(socket: &UnixStream, expected: usize) -> VesselResult<Vec<OwnedFd>> {
    if expected == 0 || expected > MAX_FDS {
        return Err(VesselError::Setup(format!(
            "refusing to receive {expected} descriptors"
        )));
    }

    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS]);

    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(|e| VesselError::Setup(format!("recvmsg(SCM_RIGHTS): {e}")))?;

    let mut fds = Vec::new();
    for cmsg in msg
        .cmsgs()
        .map_err(|e| VesselError::Setup(format!("cmsgs: {e}")))?
    {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                // Safety: the kernel just installed these descriptors for us.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    if fds.len() != expected {
        return Err(VesselError::Setup(format!(
            "expected {expected} descriptors, received {}",
            fds.len()
        )));
    }
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_fd_crosses_socket_and_stays_usable() {
        let (left, right) = UnixStream::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"payload").unwrap();

        send_fds(&left, &[file.as_raw_fd()]).unwrap();
        let mut received = recv_fds(&right, 1).unwrap();
        assert_eq!(received.len(), 1);

        let mut clone = std::fs::File::from(received.pop().unwrap());
        clone.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        clone.read_to_string(&mut content).unwrap();
        assert_eq!(content, "payload");
    }

    #[test]
    fn test_multiple_fds_in_one_transfer() {
        let (left, right) = UnixStream::pair().unwrap();
        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();

        send_fds(&left, &[a.as_raw_fd(), b.as_raw_fd()]).unwrap();
        let received = recv_fds(&right, 2).unwrap();
        assert_eq!(received.len(), 2);
    }

    #[test]
    fn test_count_mismatch_is_error() {
        let (left, right) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fds(&left, &[file.as_raw_fd()]).unwrap();
        assert!(recv_fds(&right, 2).is_err());
    }

    #[test]
    fn test_empty_send_rejected() {
        let (left, _right) = UnixStream::pair().unwrap();
        assert!(send_fds(&left, &[]).is_err());
    }
}
