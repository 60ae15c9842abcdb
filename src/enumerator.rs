use crate::error::{Error, Result};
use crate::io::{open_reader, open_writer, RecordSource};
use crate::records::{TokenId, TokenPair, Weighted};

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    t2i: HashMap<String, TokenId>,
    i2t: Vec<String>,
}

/// Thread safe string interner. Ids are handed out densely from 0 in order
/// of first sight and never change afterwards.
#[derive(Debug, Default)]
pub struct Enumerator {
    tables: RwLock<Tables>,
}

impl Enumerator {

    pub fn new() -> Enumerator {
        Self::default()
    }

    pub fn index_of(&self, value: &str) -> Result<TokenId> {
        if let Some(id) = self.read()?.t2i.get(value) {
            return Ok(*id);
        }
        let mut tables = self.tables.write().map_err(|_| Error::disconnected("enumerator lock poisoned"))?;
        // another writer may have added it meanwhile
        if let Some(id) = tables.t2i.get(value) {
            return Ok(*id);
        }
        let id = TokenId::try_from(tables.i2t.len())
            .map_err(|_| Error::format("enumerator", "token id space exhausted"))?;
        tables.t2i.insert(value.to_owned(), id);
        tables.i2t.push(value.to_owned());
        Ok(id)
    }

    pub fn value_of(&self, id: TokenId) -> Result<String> {
        self.read()?
            .i2t
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Error::format("enumerator", format!("unknown token id {}", id)))
    }

    pub fn len(&self) -> usize {
        self.read().map(|t| t.i2t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| Error::disconnected("enumerator lock poisoned"))
    }

    /// Writes the token to id map as a JSON object.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tables = self.read()?;
        let mut writer = open_writer(path, false)?;
        serde_json::to_writer(&mut writer, &tables.t2i)?;
        writer.finish().map_err(|e| Error::io(format!("cannot write {}", path.display()), e))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Enumerator> {
        let reader = open_reader(path)?;
        let t2i: HashMap<String, TokenId> = serde_json::from_reader(reader)?;
        let mut i2t = vec![None; t2i.len()];
        for (token, &id) in &t2i {
            match i2t.get_mut(id as usize) {
                Some(slot) if slot.is_none() => *slot = Some(token.clone()),
                _ => {
                    return Err(Error::format(path.display().to_string(), format!("ids are not dense at {}", id)))
                }
            }
        }
        let i2t: Vec<String> = i2t.into_iter().flatten().collect();
        Ok(Self { tables: RwLock::new(Tables { t2i, i2t }) })
    }
}

/// Writes similarity pairs with both ids replaced by their strings, one
/// `entry<TAB>neighbour<TAB>score` line each. Returns the number of lines.
pub fn unindex_pairs(pairs: RecordSource<Weighted<TokenPair>>, entries: &Enumerator, dst: &Path) -> Result<u64> {
    let mut writer = open_writer(dst, false)?;
    let mut lines = 0;
    for pair in pairs {
        let pair = pair?;
        writeln!(writer, "{}\t{}\t{}", entries.value_of(pair.record.id1)?, entries.value_of(pair.record.id2)?, pair.weight)
            .map_err(|e| Error::io(format!("cannot write {}", dst.display()), e))?;
        lines += 1;
    }
    writer.finish().map_err(|e| Error::io(format!("cannot write {}", dst.display()), e))?;
    Ok(lines)
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::{read_to_string, vec_source};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn ids_are_dense_and_stable() {
        let e = Enumerator::new();
        assert_eq!(e.index_of("cat").unwrap(), 0);
        assert_eq!(e.index_of("dog").unwrap(), 1);
        assert_eq!(e.index_of("cat").unwrap(), 0);
        assert_eq!(e.value_of(1).unwrap(), "dog");
        assert!(e.value_of(2).is_err());
        assert_eq!(e.len(), 2);
    }

    #[test]
    fn concurrent_interning() {
        let e = Arc::new(Enumerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let e = e.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        e.index_of(&format!("w{}", i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(e.len(), 100);
        for i in 0..100u32 {
            let value = e.value_of(i).unwrap();
            assert_eq!(e.index_of(&value).unwrap(), i);
        }
    }

    #[test]
    fn save_load_and_unindex() {
        let dir = TempDir::new().unwrap();
        let e = Enumerator::new();
        for w in ["a", "b", "c"] {
            e.index_of(w).unwrap();
        }
        let path = dir.path().join("entries.index.json");
        e.save(&path).unwrap();
        let loaded = Enumerator::load(&path).unwrap();
        assert_eq!(loaded.value_of(2).unwrap(), "c");
        assert_eq!(loaded.index_of("b").unwrap(), 1);

        let pairs = vec![Weighted::new(TokenPair::new(0, 2), 0.5), Weighted::new(TokenPair::new(1, 0), 0.25)];
        let dst = dir.path().join("neighbours.strings");
        assert_eq!(unindex_pairs(vec_source(pairs), &loaded, &dst).unwrap(), 2);
        assert_eq!(read_to_string(&dst).unwrap(), "a\tc\t0.5\nb\ta\t0.25\n");
    }
}
