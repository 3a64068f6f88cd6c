use std::fs;
use std::io;

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub path: Option<String>,
}

impl MapEntry {
    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Reads the memory map of `pid` ("self" for the current process).
pub fn maps(pid: &str) -> io::Result<Vec<MapEntry>> {
    let data = fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(parse_maps(&data))
}

/// Parses maps text, skipping lines that do not match the kernel format.
pub fn parse_maps(data: &str) -> Vec<MapEntry> {
    data.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let dev = fields.next()?;
    let inode = fields.next()?;
    let path = fields.next().map(str::to_owned);

    let (start, end) = range.split_once('-')?;
    let (dev_major, dev_minor) = dev.split_once(':')?;

    Some(MapEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms: perms.to_owned(),
        offset: u64::from_str_radix(offset, 16).ok()?,
        dev_major: u32::from_str_radix(dev_major, 16).ok()?,
        dev_minor: u32::from_str_radix(dev_minor, 16).ok()?,
        inode: inode.parse().ok()?,
        path,
    })
}

/// Load base of the first mapping whose path contains `name`.
pub fn find_module_base(name: &str) -> io::Result<Option<u64>> {
    Ok(maps("self")?
        .into_iter()
        .find(|e| e.path.as_deref().is_some_and(|p| p.contains(name)))
        .map(|e| e.start))
}

/// Full path of the first mapping whose path contains `name`.
pub fn find_module_path(name: &str) -> io::Result<Option<String>> {
    Ok(maps("self")?
        .into_iter()
        .filter_map(|e| e.path)
        .find(|p| p.contains(name)))
}
