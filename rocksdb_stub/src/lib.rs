use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug)]
pub struct Error(String);
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for Error {}

#[derive(Default)]
pub struct Options;
impl Options {
    pub fn create_if_missing(&mut self, _: bool) {}
    pub fn create_missing_column_families(&mut self, _: bool) {}
    pub fn set_max_open_files(&mut self, _: i32) {}
    pub fn set_keep_log_file_num(&mut self, _: usize) {}
    pub fn set_block_based_table_factory(&mut self, _: &BlockBasedOptions) {}
    pub fn set_compression_type(&mut self, _: DBCompressionType) {}
    pub fn set_write_buffer_size(&mut self, _: usize) {}
    pub fn optimize_for_point_lookup(&mut self, _: u64) {}
}

#[derive(Default)]
pub struct BlockBasedOptions;
impl BlockBasedOptions {
    pub fn set_block_cache(&mut self, _: &Cache) {}
    pub fn set_bloom_filter(&mut self, _: f64, _: bool) {}
    pub fn set_block_size(&mut self, _: usize) {}
}

pub struct Cache;
impl Cache {
    pub fn new_lru_cache(_: usize) -> Self {
        Cache
    }
}

pub enum DBCompressionType {
    None,
}

pub struct ColumnFamilyDescriptor {
    name: String,
}
impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>, _: Options) -> Self {
        Self { name: name.into() }
    }
}

pub struct ColumnFamily {
    name: String,
}

pub enum IteratorMode {
    Start,
}

#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<(String, Vec<u8>, Option<Vec<u8>>)>,
}
impl WriteBatch {
    pub fn put_cf(&mut self, cf: &&ColumnFamily, key: impl AsRef<[u8]>, val: impl AsRef<[u8]>) {
        self.ops.push((
            cf.name.clone(),
            key.as_ref().to_vec(),
            Some(val.as_ref().to_vec()),
        ));
    }
    pub fn delete_cf(&mut self, cf: &&ColumnFamily, key: impl AsRef<[u8]>) {
        self.ops.push((cf.name.clone(), key.as_ref().to_vec(), None));
    }
}

#[derive(Default)]
pub struct WriteOptions;
impl WriteOptions {
    pub fn set_sync(&mut self, _: bool) {}
}

pub struct SingleThreaded;

pub struct DBWithThreadMode<T> {
    cfs: Vec<ColumnFamily>,
    data: Mutex<BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
    path: std::path::PathBuf,
    _mode: std::marker::PhantomData<T>,
}

fn disk_path(path: &Path) -> std::path::PathBuf {
    path.join("stub_db.bin")
}

impl<T> DBWithThreadMode<T> {
    pub fn open_cf_descriptors(
        _: &Options,
        path: impl AsRef<Path>,
        cfs: Vec<ColumnFamilyDescriptor>,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(|e| Error(e.to_string()))?;
        let mut data: BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>> = BTreeMap::new();
        if let Ok(bytes) = std::fs::read(disk_path(&path)) {
            let mut i = 0usize;
            while i + 12 <= bytes.len() {
                let nl = u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap()) as usize;
                let kl = u32::from_le_bytes(bytes[i + 4..i + 8].try_into().unwrap()) as usize;
                let vl = u32::from_le_bytes(bytes[i + 8..i + 12].try_into().unwrap()) as usize;
                i += 12;
                let name = String::from_utf8_lossy(&bytes[i..i + nl]).into_owned();
                i += nl;
                let key = bytes[i..i + kl].to_vec();
                i += kl;
                let val = bytes[i..i + vl].to_vec();
                i += vl;
                data.entry(name).or_default().insert(key, val);
            }
        }
        Ok(Self {
            cfs: cfs
                .into_iter()
                .map(|d| ColumnFamily { name: d.name })
                .collect(),
            data: Mutex::new(data),
            path,
            _mode: std::marker::PhantomData,
        })
    }

    fn persist(&self, data: &BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>) -> Result<(), Error> {
        let mut out = Vec::new();
        for (name, map) in data {
            for (k, v) in map {
                out.extend_from_slice(&(name.len() as u32).to_le_bytes());
                out.extend_from_slice(&(k.len() as u32).to_le_bytes());
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(k);
                out.extend_from_slice(v);
            }
        }
        std::fs::write(disk_path(&self.path), out).map_err(|e| Error(e.to_string()))
    }

    pub fn cf_handle(&self, name: &str) -> Option<&ColumnFamily> {
        self.cfs.iter().find(|c| c.name == name)
    }

    pub fn get_cf(&self, cf: &&ColumnFamily, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(&cf.name)
            .and_then(|m| m.get(key.as_ref()).cloned()))
    }

    pub fn write(&self, batch: WriteBatch) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        for (cf, key, val) in batch.ops {
            let map = data.entry(cf).or_default();
            match val {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        self.persist(&data)
    }

    pub fn write_opt(&self, batch: WriteBatch, _: &WriteOptions) -> Result<(), Error> {
        self.write(batch)
    }

    pub fn iterator_cf<'a>(
        &'a self,
        cf: &&ColumnFamily,
        _: IteratorMode,
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), Error>> + 'a {
        let items: Vec<_> = self
            .data
            .lock()
            .unwrap()
            .get(&cf.name)
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        Ok((
                            k.clone().into_boxed_slice(),
                            v.clone().into_boxed_slice(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        items.into_iter()
    }
}
