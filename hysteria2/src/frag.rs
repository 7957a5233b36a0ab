//! UDP 消息分片与重组

use bytes::BytesMut;

use crate::protocol::UdpMessage;

/// 把超过 `max_size` 的消息切成多个分片，每个分片都带完整头部
///
/// 消息本身放得下时原样返回。调用方负责事先设置非零的包 ID。
pub fn frag_udp_message(msg: &UdpMessage, max_size: usize) -> Vec<UdpMessage> {
    if msg.size() <= max_size {
        return vec![msg.clone()];
    }
    let max_payload = max_size.saturating_sub(msg.header_size()).max(1);
    let frag_count = msg.data.len().div_ceil(max_payload);
    msg.data
        .chunks(max_payload)
        .enumerate()
        .map(|(frag_id, _)| {
            let start = frag_id * max_payload;
            let end = (start + max_payload).min(msg.data.len());
            UdpMessage {
                frag_id: frag_id as u8,
                frag_count: frag_count as u8,
                data: msg.data.slice(start..end),
                ..msg.clone()
            }
        })
        .collect()
}

/// 分片重组器
///
/// 一次只跟踪一个包：收到新包 ID 的分片时丢弃之前未完成的包。
#[derive(Debug, Default)]
pub struct Defragger {
    packet_id: u16,
    frags: Vec<Option<UdpMessage>>,
    count: usize,
    size: usize,
}

impl Defragger {
    /// 送入一个分片，包的所有分片到齐时返回重组后的完整消息
    pub fn feed(&mut self, msg: UdpMessage) -> Option<UdpMessage> {
        if msg.frag_count <= 1 {
            return Some(msg);
        }
        if msg.frag_id >= msg.frag_count {
            return None;
        }
        let frag_id = msg.frag_id as usize;
        if msg.packet_id != self.packet_id || usize::from(msg.frag_count) != self.frags.len() {
            // 新的包，清除旧状态
            self.packet_id = msg.packet_id;
            self.frags = vec![None; usize::from(msg.frag_count)];
            self.count = 1;
            self.size = msg.data.len();
            self.frags[frag_id] = Some(msg);
            return None;
        }
        if self.frags[frag_id].is_some() {
            return None;
        }
        self.count += 1;
        self.size += msg.data.len();
        self.frags[frag_id] = Some(msg);
        if self.count < self.frags.len() {
            return None;
        }

        let mut data = BytesMut::with_capacity(self.size);
        let mut first = None;
        for frag in self.frags.drain(..).flatten() {
            data.extend_from_slice(&frag.data);
            first.get_or_insert(frag);
        }
        self.count = 0;
        self.size = 0;
        first.map(|head| UdpMessage {
            frag_id: 0,
            frag_count: 1,
            data: data.freeze(),
            ..head
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(data: &'static [u8]) -> UdpMessage {
        UdpMessage {
            session_id: 1,
            packet_id: 42,
            frag_id: 0,
            frag_count: 1,
            addr: "example.com:53".to_string(),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_small_message_not_fragmented() {
        let msg = message(b"hello");
        let frags = frag_udp_message(&msg, 1200);
        assert_eq!(frags, vec![msg]);
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let msg = message(b"0123456789abcdefghijklmnopqrstuvwxyz");
        let max_size = msg.header_size() + 10;
        let frags = frag_udp_message(&msg, max_size);

        assert_eq!(frags.len(), 4);
        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag.frag_id as usize, i);
            assert_eq!(frag.frag_count, 4);
            assert!(frag.size() <= max_size);
        }

        let mut defragger = Defragger::default();
        let mut out = None;
        // 乱序送入
        for i in [2, 0, 3, 1] {
            out = defragger.feed(frags[i].clone());
        }
        let out = out.expect("all fragments received");
        assert_eq!(out.data, msg.data);
        assert_eq!(out.frag_count, 1);
        assert_eq!(out.addr, msg.addr);
    }

    #[test]
    fn test_new_packet_discards_incomplete_one() {
        let msg = message(b"0123456789abcdefghij");
        let max_size = msg.header_size() + 10;
        let old = frag_udp_message(&msg, max_size);
        let new = frag_udp_message(
            &UdpMessage {
                packet_id: 43,
                ..msg.clone()
            },
            max_size,
        );

        let mut defragger = Defragger::default();
        assert!(defragger.feed(old[0].clone()).is_none());
        assert!(defragger.feed(new[0].clone()).is_none());
        // 旧包的剩余分片不会拼进新包
        assert!(defragger.feed(old[1].clone()).is_none());
        let out = defragger.feed(new[1].clone()).unwrap();
        assert_eq!(out.packet_id, 43);
        assert_eq!(out.data, msg.data);
    }

    #[test]
    fn test_invalid_fragment_ignored() {
        let mut defragger = Defragger::default();
        let bad = UdpMessage {
            frag_id: 3,
            frag_count: 2,
            ..message(b"x")
        };
        assert!(defragger.feed(bad).is_none());
    }
}
