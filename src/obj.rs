use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::dynstr::DynStr;
use crate::error::CmdError;

/// A keyspace value: one of the five supported kinds.
#[derive(Clone, Debug)]
pub enum Value {
    Str(DynStr),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    ZSet(SortedSet),
}

impl Value {
    /// The name TYPE reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
        }
    }

    /// Rough in-memory footprint, used by the soft max-memory limit.
    pub fn approx_size(&self) -> usize {
        const OVERHEAD: usize = 48;
        match self {
            Value::Str(s) => OVERHEAD + s.capacity(),
            Value::List(l) => OVERHEAD + l.iter().map(|e| e.len() + 24).sum::<usize>(),
            Value::Hash(h) => {
                OVERHEAD + h.iter().map(|(f, v)| f.len() + v.len() + 48).sum::<usize>()
            }
            Value::Set(s) => OVERHEAD + s.iter().map(|m| m.len() + 24).sum::<usize>(),
            Value::ZSet(z) => OVERHEAD + z.iter().map(|(m, _)| 2 * m.len() + 64).sum::<usize>(),
        }
    }

    pub fn as_str(&self) -> Result<&DynStr, CmdError> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_str_mut(&mut self) -> Result<&mut DynStr, CmdError> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_list(&self) -> Result<&VecDeque<Vec<u8>>, CmdError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_list_mut(&mut self) -> Result<&mut VecDeque<Vec<u8>>, CmdError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_hash(&self) -> Result<&HashMap<Vec<u8>, Vec<u8>>, CmdError> {
        match self {
            Value::Hash(h) => Ok(h),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_hash_mut(&mut self) -> Result<&mut HashMap<Vec<u8>, Vec<u8>>, CmdError> {
        match self {
            Value::Hash(h) => Ok(h),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_set(&self) -> Result<&HashSet<Vec<u8>>, CmdError> {
        match self {
            Value::Set(s) => Ok(s),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_set_mut(&mut self) -> Result<&mut HashSet<Vec<u8>>, CmdError> {
        match self {
            Value::Set(s) => Ok(s),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_zset(&self) -> Result<&SortedSet, CmdError> {
        match self {
            Value::ZSet(z) => Ok(z),
            _ => Err(CmdError::WrongType),
        }
    }

    pub fn as_zset_mut(&mut self) -> Result<&mut SortedSet, CmdError> {
        match self {
            Value::ZSet(z) => Ok(z),
            _ => Err(CmdError::WrongType),
        }
    }

    /// An aggregate that became empty is removed from the keyspace.
    pub fn is_emptied_aggregate(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.len() == 0,
        }
    }
}

/// Ordering key for the sorted set: score ascending, ties broken by
/// lexicographic member comparison. Scores are finite or infinite
/// doubles; NaN is rejected at the command layer, so total_cmp gives the
/// required total order.
#[derive(Clone, Debug, PartialEq)]
struct ZKey {
    score: f64,
    member: Vec<u8>,
}

impl Eq for ZKey {}

impl Ord for ZKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

impl PartialOrd for ZKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Member -> score mapping with an ordered view for rank and score range
/// queries.
#[derive(Clone, Debug, Default)]
pub struct SortedSet {
    scores: HashMap<Vec<u8>, f64>,
    ordered: BTreeSet<ZKey>,
}

impl SortedSet {
    pub fn new() -> SortedSet {
        SortedSet::default()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Insert or update. Returns true when the member is new.
    pub fn insert(&mut self, member: Vec<u8>, score: f64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&ZKey {
                    score: old,
                    member: member.clone(),
                });
                self.ordered.insert(ZKey { score, member });
                false
            }
            None => {
                self.ordered.insert(ZKey { score, member });
                true
            }
        }
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&ZKey {
                    score,
                    member: member.to_vec(),
                });
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// 0-based position in (score asc, member lex) order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        let key = ZKey {
            score,
            member: member.to_vec(),
        };
        Some(self.ordered.iter().take_while(|k| **k < key).count())
    }

    /// Members in order, inclusive rank range. Bounds are assumed
    /// normalized (0 <= start <= end < len) by the caller.
    pub fn range_by_rank(&self, start: usize, end: usize) -> Vec<(&[u8], f64)> {
        self.ordered
            .iter()
            .skip(start)
            .take(end - start + 1)
            .map(|k| (k.member.as_slice(), k.score))
            .collect()
    }

    /// Members whose score lies within [min, max], either bound
    /// optionally exclusive.
    pub fn range_by_score(
        &self,
        min: f64,
        min_excl: bool,
        max: f64,
        max_excl: bool,
    ) -> Vec<(&[u8], f64)> {
        self.ordered
            .iter()
            .skip_while(|k| if min_excl { k.score <= min } else { k.score < min })
            .take_while(|k| if max_excl { k.score < max } else { k.score <= max })
            .map(|k| (k.member.as_slice(), k.score))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], f64)> + '_ {
        self.ordered.iter().map(|k| (k.member.as_slice(), k.score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zset_orders_by_score_then_member() {
        let mut z = SortedSet::new();
        assert!(z.insert(b"b".to_vec(), 2.0));
        assert!(z.insert(b"a".to_vec(), 2.0));
        assert!(z.insert(b"c".to_vec(), 1.0));
        let members: Vec<&[u8]> = z.iter().map(|(m, _)| m).collect();
        assert_eq!(members, vec![b"c" as &[u8], b"a", b"b"]);
        assert_eq!(z.rank(b"c"), Some(0));
        assert_eq!(z.rank(b"a"), Some(1));
        assert_eq!(z.rank(b"b"), Some(2));
        assert_eq!(z.rank(b"missing"), None);
    }

    #[test]
    fn zset_update_moves_member() {
        let mut z = SortedSet::new();
        z.insert(b"m".to_vec(), 1.0);
        assert!(!z.insert(b"m".to_vec(), 9.0));
        assert_eq!(z.len(), 1);
        assert_eq!(z.score(b"m"), Some(9.0));
        assert_eq!(z.rank(b"m"), Some(0));
    }

    #[test]
    fn zset_score_ranges() {
        let mut z = SortedSet::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            z.insert(m.as_bytes().to_vec(), s);
        }
        let inclusive = z.range_by_score(1.0, false, 2.0, false);
        assert_eq!(inclusive.len(), 2);
        let exclusive = z.range_by_score(1.0, true, 3.0, true);
        assert_eq!(exclusive.len(), 1);
        assert_eq!(exclusive[0].0, b"b");
        let all = z.range_by_score(f64::NEG_INFINITY, false, f64::INFINITY, false);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn emptied_aggregates_report_it() {
        assert!(Value::List(VecDeque::new()).is_emptied_aggregate());
        assert!(!Value::Str(DynStr::from_bytes(b"")).is_emptied_aggregate());
    }
}
