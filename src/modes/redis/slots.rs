/// Hash slots and the `CLUSTER NODES` node table
use crate::utils::{crc16, extract_hash_tag};
use log::debug;

/// Number of hash slots in a Redis cluster
pub const HASH_SLOTS: usize = 16384;

/// Slot owning `key`, honouring `{hash tags}`
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(extract_hash_tag(key)) % HASH_SLOTS as u16
}

/// Inclusive range of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// `0-5460` or a single `42`; anything else, including `[...]`
    /// migration markers, is not a range
    pub fn parse(field: &str) -> Option<Self> {
        if field.starts_with('[') {
            return None;
        }
        let range = match field.split_once('-') {
            Some((start, end)) => Self::new(start.parse().ok()?, end.parse().ok()?),
            None => {
                let slot = field.parse().ok()?;
                Self::new(slot, slot)
            }
        };
        if range.start > range.end || range.end as usize >= HASH_SLOTS {
            return None;
        }
        Some(range)
    }
}

/// One line of `CLUSTER NODES`
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub id: String,
    /// `host:port`, without the cluster bus port
    pub address: String,
    pub flags: Vec<String>,
    pub master_id: Option<String>,
    pub link_state: String,
    pub slots: Vec<SlotRange>,
}

impl NodeEntry {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_master(&self) -> bool {
        self.has_flag("master")
    }

    /// `fail` or the unconfirmed `fail?`
    pub fn is_failing(&self) -> bool {
        self.flags.iter().any(|f| f.starts_with("fail"))
    }

    /// Parse one table line; lines with fewer than 8 fields yield `None`
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            return None;
        }

        let address = parts[1].split('@').next().unwrap_or(parts[1]).to_string();
        let master_id = match parts[3] {
            "-" => None,
            id => Some(id.to_string()),
        };

        Some(Self {
            id: parts[0].to_string(),
            address,
            flags: parts[2].split(',').map(str::to_string).collect(),
            master_id,
            link_state: parts[7].to_string(),
            slots: parts[8..].iter().filter_map(|field| SlotRange::parse(field)).collect(),
        })
    }
}

/// Parse a whole `CLUSTER NODES` reply
pub fn parse_cluster_nodes(table: &str) -> Vec<NodeEntry> {
    table
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let entry = NodeEntry::parse(line);
            if entry.is_none() {
                debug!("Skipping malformed cluster nodes line: {}", line);
            }
            entry
        })
        .collect()
}

/// Slot to node-index table
#[derive(Debug, Clone, PartialEq)]
pub struct SlotMap {
    owners: Vec<Option<usize>>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            owners: vec![None; HASH_SLOTS],
        }
    }

    /// Every slot owned by `node`
    pub fn single_owner(node: usize) -> Self {
        Self {
            owners: vec![Some(node); HASH_SLOTS],
        }
    }

    pub fn assign(&mut self, range: SlotRange, node: usize) {
        for owner in &mut self.owners[range.start as usize..=range.end as usize] {
            *owner = Some(node);
        }
    }

    pub fn owner(&self, slot: u16) -> Option<usize> {
        self.owners.get(slot as usize).copied().flatten()
    }

    pub fn assigned(&self) -> usize {
        self.owners.iter().filter(|owner| owner.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.assigned() == HASH_SLOTS
    }

    pub fn missing_slots(&self) -> Vec<u16> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.is_none())
            .map(|(slot, _)| slot as u16)
            .collect()
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const NODE_TABLE: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005 slave 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 0 1426238316232 5 connected
824fe116063bc5fcf9f4ffd395bc17adf3a3a6b2 127.0.0.1:30006@31006 slave 292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 0 1426238317741 6 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn test_key_slot_hash_tags() {
        let tagged = key_slot(b"42");
        assert_eq!(key_slot(b"user{42}:profile"), tagged);
        assert_eq!(key_slot(b"order{42}:items"), tagged);
        assert_eq!(key_slot(b"{42}"), tagged);
        assert_eq!(key_slot(b"foo{42}bar"), tagged);
    }

    #[test]
    fn test_key_slot_plain_keys() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"123456789"), 12739);
        // Empty and unterminated tags hash the whole key
        assert_eq!(key_slot(b"foo{}bar"), crc16(b"foo{}bar") % 16384);
        assert_eq!(key_slot(b"foo{bar"), crc16(b"foo{bar") % 16384);
    }

    #[test]
    fn test_slot_range_parse() {
        assert_eq!(SlotRange::parse("0-5460"), Some(SlotRange::new(0, 5460)));
        assert_eq!(SlotRange::parse("42"), Some(SlotRange::new(42, 42)));
        assert_eq!(SlotRange::parse("[93->-292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f]"), None);
        assert_eq!(SlotRange::parse("[77-<-67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1]"), None);
        assert_eq!(SlotRange::parse("10-5"), None);
        assert_eq!(SlotRange::parse("16384"), None);
        assert_eq!(SlotRange::new(0, 5460).size(), 5461);
    }

    #[test]
    fn test_parse_node_table() {
        let entries = parse_cluster_nodes(NODE_TABLE);
        assert_eq!(entries.len(), 6);

        let replica = &entries[0];
        assert_eq!(replica.address, "127.0.0.1:30004");
        assert!(!replica.is_master());
        assert_eq!(
            replica.master_id.as_deref(),
            Some("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca")
        );
        assert!(replica.slots.is_empty());

        let myself = &entries[5];
        assert!(myself.is_master());
        assert!(myself.has_flag("myself"));
        assert_eq!(myself.master_id, None);
        assert_eq!(myself.link_state, "connected");
        assert_eq!(myself.slots, vec![SlotRange::new(0, 5460)]);
    }

    #[test]
    fn test_short_lines_are_skipped() {
        let table = "abc 127.0.0.1:1 master -\n\n   \n";
        assert!(parse_cluster_nodes(table).is_empty());
    }

    #[test]
    fn test_failing_flag() {
        let line = "id1 10.0.0.1:6379@16379 master,fail - 0 0 1 disconnected 0-100";
        let entry = NodeEntry::parse(line).unwrap();
        assert!(entry.is_failing());
        assert_eq!(entry.link_state, "disconnected");

        let line = "id2 10.0.0.2:6379@16379 master,fail? - 0 0 2 connected 101-200";
        let entry = NodeEntry::parse(line).unwrap();
        assert!(entry.is_failing());
        assert!(entry.is_master());

        let line = "id3 10.0.0.3:6379@16379 slave id2 0 0 2 connected";
        assert!(!NodeEntry::parse(line).unwrap().is_failing());
    }

    #[test]
    fn test_slot_map_assignment() {
        let mut map = SlotMap::new();
        map.assign(SlotRange::new(0, 8191), 0);
        assert_eq!(map.owner(0), Some(0));
        assert_eq!(map.owner(8191), Some(0));
        assert_eq!(map.owner(8192), None);
        assert!(!map.is_complete());
        assert_eq!(map.missing_slots().len(), 8192);

        map.assign(SlotRange::new(8192, 16383), 1);
        assert!(map.is_complete());
        assert_eq!(map.assigned(), HASH_SLOTS);
    }

    #[test]
    fn test_single_owner_covers_everything() {
        let map = SlotMap::single_owner(0);
        assert!(map.is_complete());
        assert_eq!(map.owner(16383), Some(0));
    }
}
