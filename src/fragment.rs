//! 프래그먼트 분할과 재조립
//!
//! - Fragment: 패킷 하나에 실리는 조각 (최대 992 bytes)
//! - Reassembly: 수신측 누적기, 받은 ID로 누락 추적

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::packet::{checksum, Packet, PacketType};
use crate::{Error, Result, DATA_SIZE};

/// 프래그먼트 ID (전송 내 시퀀스 번호)
pub type FragmentId = u32;

/// 패킷으로 바로 보낼 수 있는 조각
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: FragmentId,
    pub packet_type: PacketType,
    pub data: Bytes,

    /// 이 조각 데이터만의 체크섬
    pub checksum: u32,
}

impl Fragment {
    pub fn new(id: FragmentId, packet_type: PacketType, data: Bytes) -> Self {
        Self {
            id,
            packet_type,
            checksum: checksum(&data),
            data,
        }
    }

    pub fn to_packet(&self) -> Packet {
        Packet {
            id: self.id,
            packet_type: self.packet_type,
            checksum: self.checksum,
            payload: self.data.clone(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_packet().to_bytes()
    }

    /// 수신 패킷을 프래그먼트로 (체크섬 검증 포함)
    pub fn from_packet(packet: Packet) -> Result<Self> {
        packet.verify_checksum()?;
        Ok(Self {
            id: packet.id,
            packet_type: packet.packet_type,
            checksum: packet.checksum,
            data: packet.payload,
        })
    }
}

/// 페이로드를 DATA_SIZE 단위로 분할
///
/// 빈 페이로드는 빈 목록 (빈 파일 전송은 호출측에서 처리)
pub fn fragment(payload: &[u8], packet_type: PacketType, start_id: FragmentId) -> Vec<Fragment> {
    let payload = Bytes::copy_from_slice(payload);
    (0..payload.len())
        .step_by(DATA_SIZE)
        .enumerate()
        .map(|(idx, offset)| {
            let end = (offset + DATA_SIZE).min(payload.len());
            Fragment::new(start_id + idx as u32, packet_type, payload.slice(offset..end))
        })
        .collect()
}

/// 분할 시 생성될 프래그먼트 수
pub fn fragment_count(len: usize) -> u32 {
    ((len + DATA_SIZE - 1) / DATA_SIZE) as u32
}

/// ID 순으로 정렬 후 이어붙임
///
/// 누락 검사는 하지 않음 (누락 검출이 필요하면 `Reassembly` 사용)
pub fn reassemble(fragments: &[Fragment]) -> Bytes {
    let mut ordered: Vec<&Fragment> = fragments.iter().collect();
    ordered.sort_by_key(|f| f.id);

    let total: usize = ordered.iter().map(|f| f.data.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for fragment in ordered {
        buf.extend_from_slice(&fragment.data);
    }
    buf.freeze()
}

/// 프래그먼트 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New,
    Duplicate,
}

/// 수신측 재조립 상태
///
/// 받은 조각만 저장하므로 `expected`가 커도 미리 할당하지 않는다
#[derive(Debug)]
pub struct Reassembly {
    first_id: FragmentId,
    expected: u32,

    /// 수신한 조각 (ID 순)
    received: BTreeMap<FragmentId, Bytes>,
}

impl Reassembly {
    /// `expected`개의 프래그먼트를 `first_id`부터 기대
    pub fn new(first_id: FragmentId, expected: u32) -> Self {
        Self {
            first_id,
            expected,
            received: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// 범위 밖 ID면 `FragmentOutOfRange`
    fn check_range(&self, id: FragmentId) -> Result<()> {
        let first = u64::from(self.first_id);
        let end = first + u64::from(self.expected);
        if u64::from(id) < first || u64::from(id) >= end {
            return Err(Error::FragmentOutOfRange {
                id,
                first: self.first_id,
                last: end.saturating_sub(1).min(u64::from(u32::MAX)) as u32,
            });
        }
        Ok(())
    }

    /// 프래그먼트 삽입 (중복은 무시)
    pub fn insert(&mut self, fragment: &Fragment) -> Result<Inserted> {
        self.check_range(fragment.id)?;
        if self.received.contains_key(&fragment.id) {
            return Ok(Inserted::Duplicate);
        }

        self.received.insert(fragment.id, fragment.data.clone());
        Ok(Inserted::New)
    }

    pub fn contains(&self, id: FragmentId) -> bool {
        self.received.contains_key(&id)
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() >= self.expected
    }

    /// 누락된 프래그먼트 ID 목록
    pub fn missing_ids(&self) -> Vec<FragmentId> {
        (0..self.expected)
            .filter_map(|offset| self.first_id.checked_add(offset))
            .filter(|id| !self.received.contains_key(id))
            .collect()
    }

    /// 완성된 페이로드 추출, 누락이 있으면 `FragmentGap`
    pub fn finish(self) -> Result<Bytes> {
        let missing = self.missing_ids();
        if !missing.is_empty() {
            return Err(Error::FragmentGap { missing });
        }

        let total: usize = self.received.values().map(|d| d.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for data in self.received.into_values() {
            buf.extend_from_slice(&data);
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_fragment_sizes() {
        let data = sample(2500);
        let fragments = fragment(&data, PacketType::PutData, 1);

        let sizes: Vec<usize> = fragments.iter().map(|f| f.data.len()).collect();
        assert_eq!(sizes, vec![992, 992, 516]);

        let ids: Vec<u32> = fragments.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(fragment_count(data.len()), 3);
    }

    #[test]
    fn test_fragment_checksum_is_per_chunk() {
        let data = sample(1500);
        let fragments = fragment(&data, PacketType::GetData, 10);

        assert_eq!(fragments[0].id, 10);
        assert_eq!(fragments[0].checksum, checksum(&data[..992]));
        assert_eq!(fragments[1].checksum, checksum(&data[992..]));
    }

    #[test]
    fn test_reassemble_boundaries() {
        for len in [0, 1, DATA_SIZE, DATA_SIZE + 1, DATA_SIZE * 3, DATA_SIZE * 3 + 1] {
            let data = sample(len);
            let fragments = fragment(&data, PacketType::PutData, 1);
            assert_eq!(fragments.len() as u32, fragment_count(len));
            assert_eq!(reassemble(&fragments).as_ref(), data.as_slice(), "len={}", len);
        }
    }

    #[test]
    fn test_reassemble_shuffled() {
        let data = sample(DATA_SIZE * 7 + 13);
        let mut fragments = fragment(&data, PacketType::PutData, 1);
        fragments.shuffle(&mut rand::thread_rng());

        assert_eq!(reassemble(&fragments).as_ref(), data.as_slice());
    }

    #[test]
    fn test_reassemble_silently_skips_gap() {
        let data = sample(DATA_SIZE * 3);
        let mut fragments = fragment(&data, PacketType::PutData, 1);
        fragments.remove(1);

        // 단순 재조립은 누락을 알아채지 못함
        assert_eq!(reassemble(&fragments).len(), DATA_SIZE * 2);
    }

    #[test]
    fn test_reassembly_detects_gap() {
        let data = sample(DATA_SIZE * 3);
        let fragments = fragment(&data, PacketType::PutData, 1);

        let mut reassembly = Reassembly::new(1, 3);
        reassembly.insert(&fragments[0]).unwrap();
        reassembly.insert(&fragments[2]).unwrap();

        assert!(!reassembly.is_complete());
        assert_eq!(reassembly.missing_ids(), vec![2]);
        assert!(matches!(
            reassembly.finish(),
            Err(Error::FragmentGap { missing }) if missing == vec![2]
        ));
    }

    #[test]
    fn test_reassembly_out_of_order_and_duplicates() {
        let data = sample(2500);
        let mut fragments = fragment(&data, PacketType::GetData, 1);
        fragments.reverse();

        let mut reassembly = Reassembly::new(1, 3);
        for f in &fragments {
            assert_eq!(reassembly.insert(f).unwrap(), Inserted::New);
        }
        assert_eq!(reassembly.insert(&fragments[0]).unwrap(), Inserted::Duplicate);
        assert_eq!(reassembly.received_count(), 3);
        assert!(reassembly.is_complete());
        assert_eq!(reassembly.finish().unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_reassembly_rejects_out_of_range() {
        let mut reassembly = Reassembly::new(1, 2);
        let stray = Fragment::new(3, PacketType::PutData, Bytes::from_static(b"x"));
        assert!(matches!(
            reassembly.insert(&stray),
            Err(Error::FragmentOutOfRange { id: 3, first: 1, last: 2 })
        ));

        let zero = Fragment::new(0, PacketType::PutData, Bytes::from_static(b"x"));
        assert!(reassembly.insert(&zero).is_err());
    }

    #[test]
    fn test_empty_reassembly_is_complete() {
        let reassembly = Reassembly::new(1, 0);
        assert!(reassembly.is_complete());
        assert!(reassembly.finish().unwrap().is_empty());
    }

    #[test]
    fn test_huge_expected_count_is_not_preallocated() {
        let mut reassembly = Reassembly::new(1, u32::MAX);
        let first = Fragment::new(1, PacketType::PutData, Bytes::from_static(b"x"));
        let last = Fragment::new(u32::MAX, PacketType::PutData, Bytes::from_static(b"y"));

        assert_eq!(reassembly.insert(&first).unwrap(), Inserted::New);
        assert_eq!(reassembly.insert(&last).unwrap(), Inserted::New);
        assert!(reassembly.contains(u32::MAX));
        assert!(!reassembly.is_complete());
    }

    #[test]
    fn test_range_check_near_u32_max() {
        let mut reassembly = Reassembly::new(u32::MAX - 1, 2);
        let ok = Fragment::new(u32::MAX, PacketType::GetData, Bytes::from_static(b"z"));
        assert_eq!(reassembly.insert(&ok).unwrap(), Inserted::New);
        assert_eq!(reassembly.missing_ids(), vec![u32::MAX - 1]);

        let before = Fragment::new(u32::MAX - 2, PacketType::GetData, Bytes::from_static(b"z"));
        assert!(matches!(
            reassembly.insert(&before),
            Err(Error::FragmentOutOfRange { last, .. }) if last == u32::MAX
        ));
    }

    #[test]
    fn test_fragment_from_corrupt_packet() {
        let mut packet = Fragment::new(4, PacketType::GetData, Bytes::from_static(b"abc")).to_packet();
        packet.payload = Bytes::from_static(b"abd");
        assert!(Fragment::from_packet(packet).is_err());
    }
}
