/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The joiner handshake: the wire protocol over which the leader sends a committed view to a
//! prospective joiner.
//!
//! All integers are 4-byte little-endian. The joiner opens a TCP connection to the leader and
//! announces its preassigned node id; once the join commits, the leader writes, in order: the
//! view number, the member count, each member's node id, each member's length-prefixed address
//! string (the length includes a NUL terminator, which is appended on the wire and stripped on
//! read), and each member's failed flag as one byte. The connection is then closed, and the
//! joiner constructs its first view from the payload.
//!
//! I/O errors abort the in-progress join; the joiner retries from scratch.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::types::{NodeId, ViewNumber};

use super::view::View;

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("joiner handshake i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("leader address is not a valid ip:port pair: {0}")]
    BadLeaderAddress(String),
    #[error("malformed handshake payload: {0}")]
    Malformed(&'static str),
    #[error("the view received from the leader does not contain this node")]
    NotAMember,
}

/// The membership descriptor carried by the handshake.
pub(crate) struct ViewPayload {
    pub(crate) vid: ViewNumber,
    pub(crate) members: Vec<NodeId>,
    pub(crate) member_addrs: Vec<String>,
    pub(crate) failed: Vec<bool>,
}

/// Leader side: write the committed view to the joiner's socket.
pub(crate) fn write_view(writer: &mut impl Write, view: &View) -> Result<(), JoinError> {
    writer.write_all(&view.vid.to_le_bytes())?;
    writer.write_all(&(view.num_members() as u32).to_le_bytes())?;
    for &member in &view.members {
        writer.write_all(&member.to_le_bytes())?;
    }
    for addr in &view.member_addrs {
        // Length includes the NUL terminator.
        let len = (addr.len() + 1) as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(addr.as_bytes())?;
        writer.write_all(&[0u8])?;
    }
    for &failed in &view.failed {
        writer.write_all(&[failed as u8])?;
    }
    writer.flush()?;
    Ok(())
}

/// Joiner side: read the view the leader committed.
pub(crate) fn read_view(reader: &mut impl Read) -> Result<ViewPayload, JoinError> {
    let vid = read_i32(reader)?;
    let num_members = read_u32(reader)? as usize;
    let mut members = Vec::with_capacity(num_members);
    for _ in 0..num_members {
        members.push(read_u32(reader)?);
    }
    let mut member_addrs = Vec::with_capacity(num_members);
    for _ in 0..num_members {
        let len = read_u32(reader)? as usize;
        if len == 0 {
            return Err(JoinError::Malformed("zero-length address"));
        }
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        if bytes.pop() != Some(0) {
            return Err(JoinError::Malformed("address missing NUL terminator"));
        }
        member_addrs.push(
            String::from_utf8(bytes).map_err(|_| JoinError::Malformed("address not UTF-8"))?,
        );
    }
    let mut failed = Vec::with_capacity(num_members);
    for _ in 0..num_members {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        failed.push(byte[0] != 0);
    }
    Ok(ViewPayload {
        vid,
        members,
        member_addrs,
        failed,
    })
}

/// Leader side: read the id the connecting joiner announces. The id must have been preassigned;
/// the caller validates it against the configured id → address map.
pub(crate) fn read_joiner_id(stream: &mut TcpStream) -> Result<NodeId, JoinError> {
    read_u32(stream).map_err(Into::into)
}

/// Joiner side: contact the leader, announce our id, and block until the leader commits a view
/// containing us.
pub(crate) fn join_existing(leader_addr: &str, my_id: NodeId) -> Result<View, JoinError> {
    log::debug!("joining group: waiting for a response from the leader at {leader_addr}");
    let addr: std::net::SocketAddr = leader_addr
        .parse()
        .map_err(|_| JoinError::BadLeaderAddress(leader_addr.to_string()))?;
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(&my_id.to_le_bytes())?;
    let payload = read_view(&mut stream)?;
    log::debug!("received view {} from leader", payload.vid);

    let my_rank = payload
        .members
        .iter()
        .position(|&member| member == my_id)
        .ok_or(JoinError::NotAMember)?;
    let n_failed = payload.failed.iter().filter(|&&failed| failed).count();
    Ok(View {
        vid: payload.vid,
        members: payload.members,
        member_addrs: payload.member_addrs,
        failed: payload.failed,
        n_failed,
        my_rank,
        i_know_i_am_leader: false,
        sst: None,
        engine: None,
    })
}

fn read_u32(reader: &mut impl Read) -> Result<u32, io::Error> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32(reader: &mut impl Read) -> Result<i32, io::Error> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_view() -> View {
        View {
            vid: 1,
            members: vec![0, 1],
            member_addrs: vec!["10.0.0.1:28000".into(), "10.0.0.2:28000".into()],
            failed: vec![false, true],
            n_failed: 1,
            my_rank: 0,
            i_know_i_am_leader: true,
            sst: None,
            engine: None,
        }
    }

    #[test]
    fn payload_matches_the_wire_image() {
        let mut bytes = Vec::new();
        write_view(&mut bytes, &sample_view()).unwrap();

        let mut expected = Vec::new();
        expected.extend(1i32.to_le_bytes()); // vid
        expected.extend(2u32.to_le_bytes()); // num_members
        expected.extend(0u32.to_le_bytes()); // member ids
        expected.extend(1u32.to_le_bytes());
        expected.extend(15u32.to_le_bytes()); // "10.0.0.1:28000" + NUL
        expected.extend(b"10.0.0.1:28000\0");
        expected.extend(15u32.to_le_bytes());
        expected.extend(b"10.0.0.2:28000\0");
        expected.extend([0u8, 1u8]); // failed flags
        assert_eq!(bytes, expected);
    }

    #[test]
    fn payload_roundtrips() {
        let mut bytes = Vec::new();
        write_view(&mut bytes, &sample_view()).unwrap();
        let payload = read_view(&mut &bytes[..]).unwrap();
        assert_eq!(payload.vid, 1);
        assert_eq!(payload.members, vec![0, 1]);
        assert_eq!(
            payload.member_addrs,
            vec!["10.0.0.1:28000".to_string(), "10.0.0.2:28000".to_string()]
        );
        assert_eq!(payload.failed, vec![false, true]);
    }

    #[test]
    fn truncated_payload_is_an_io_error() {
        let mut bytes = Vec::new();
        write_view(&mut bytes, &sample_view()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            read_view(&mut &bytes[..]),
            Err(JoinError::Io(_))
        ));
    }
}
