//! Heap dump: the object graph and the root set in a tagged record format.
//!
//! The file starts with [MAGIC] followed by the format version. Every record is
//! a tag byte followed by unsigned LEB128 fields; strings are a length and the
//! UTF-8 bytes.
//!
//! | tag | record | fields |
//! |-----|--------|--------|
//! | 0 | end | |
//! | 1 | params | word size, page size, heap live bytes, cycles |
//! | 2 | type | type id, name, element size |
//! | 3 | object | address, type id, size, field count, (offset, target)* |
//! | 4 | global root | global index, target |
//! | 5 | stack root | mutator id, frame depth, slot, target |
//!
//! Only non-null pointer fields are recorded.

use std::{
    io::{self, Read, Write},
    sync::atomic::Ordering,
};

use crate::{
    globals::{PAGE_SIZE, WORD},
    heap::HeapInner,
    safepoint::Scheduler,
    util::word_at,
};

pub const MAGIC: &[u8; 8] = b"CMSDUMP\0";
pub const VERSION: u64 = 1;

const TAG_EOF: u8 = 0;
const TAG_PARAMS: u8 = 1;
const TAG_TYPE: u8 = 2;
const TAG_OBJECT: u8 = 3;
const TAG_GLOBAL_ROOT: u8 = 4;
const TAG_STACK_ROOT: u8 = 5;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapDump {
    pub word_size: u64,
    pub page_size: u64,
    pub heap_live: u64,
    pub cycles: u64,
    pub types: Vec<DumpType>,
    pub objects: Vec<DumpObject>,
    pub roots: Vec<DumpRoot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpType {
    pub id: u32,
    pub name: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpObject {
    pub addr: u64,
    pub type_id: u32,
    pub size: u64,
    /// `(field offset, target address)` of every non-null pointer field.
    pub fields: Vec<(u64, u64)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DumpRoot {
    Global {
        index: u64,
        target: u64,
    },
    Stack {
        mutator: u64,
        depth: u64,
        slot: u64,
        target: u64,
    },
}

impl DumpRoot {
    pub fn target(&self) -> u64 {
        match self {
            DumpRoot::Global { target, .. } | DumpRoot::Stack { target, .. } => *target,
        }
    }
}

impl HeapDump {
    pub fn object_at(&self, addr: u64) -> Option<&DumpObject> {
        self.objects.iter().find(|object| object.addr == addr)
    }
}

fn write_uvarint(out: &mut impl Write, mut value: u64) -> io::Result<()> {
    let mut buf = [0u8; 10];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    out.write_all(&buf[..len])
}

fn read_uvarint(input: &mut impl Read) -> io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = read_u8(input)?;
        if shift == 63 && byte > 1 {
            return Err(invalid("uvarint overflows 64 bits"));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(invalid("uvarint overflows 64 bits"));
        }
    }
}

fn read_u8(input: &mut impl Read) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn write_string(out: &mut impl Write, s: &str) -> io::Result<()> {
    write_uvarint(out, s.len() as u64)?;
    out.write_all(s.as_bytes())
}

fn read_string(input: &mut impl Read) -> io::Result<String> {
    let len = read_uvarint(input)? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| invalid("type name is not UTF-8"))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Write the heap. The world must be stopped and no cycle in progress.
pub(crate) fn write_dump(heap: &HeapInner, out: &mut impl Write) -> io::Result<()> {
    out.write_all(MAGIC)?;
    write_uvarint(out, VERSION)?;

    out.write_all(&[TAG_PARAMS])?;
    write_uvarint(out, WORD as u64)?;
    write_uvarint(out, PAGE_SIZE as u64)?;
    write_uvarint(out, heap.allocator.heap_live() as u64)?;
    write_uvarint(out, heap.collector.cycle())?;

    let mut result: io::Result<()> = Ok(());
    heap.info.for_each_type(|index, info| {
        if result.is_ok() {
            result = (|| {
                out.write_all(&[TAG_TYPE])?;
                write_uvarint(out, index.as_u32() as u64)?;
                write_string(out, &info.name)?;
                write_uvarint(out, info.size as u64)
            })();
        }
    });
    result?;

    let mut fields = Vec::new();
    for span in heap.allocator.spans() {
        let mut result: io::Result<()> = Ok(());
        span.for_each_object(|slot, addr| {
            if result.is_err() {
                return;
            }
            let type_id = span.type_of(slot);
            fields.clear();
            if let Some(info) = heap.info.get_gc_info(crate::gc_info_table::TypeIndex(type_id)) {
                let words = (span.elem_size / info.size) * info.mask.words();
                for word in info.mask.pointer_words(words) {
                    let target = unsafe { word_at(addr + word * WORD) }.load(Ordering::Acquire);
                    if target != 0 {
                        fields.push(((word * WORD) as u64, target as u64));
                    }
                }
            }
            result = (|| {
                out.write_all(&[TAG_OBJECT])?;
                write_uvarint(out, addr as u64)?;
                write_uvarint(out, type_id as u64)?;
                write_uvarint(out, span.elem_size as u64)?;
                write_uvarint(out, fields.len() as u64)?;
                for &(offset, target) in fields.iter() {
                    write_uvarint(out, offset)?;
                    write_uvarint(out, target)?;
                }
                Ok(())
            })();
        });
        result?;
    }

    let mut result: io::Result<()> = Ok(());
    heap.roots.for_each_global(|id, target| {
        if result.is_ok() && target != 0 {
            result = (|| {
                out.write_all(&[TAG_GLOBAL_ROOT])?;
                write_uvarint(out, id.index() as u64)?;
                write_uvarint(out, target as u64)
            })();
        }
    });
    result?;

    let mut result: io::Result<()> = Ok(());
    heap.safepoint.for_each_task(&mut |mutator| {
        let stack = mutator.stack.lock();
        stack.walk(|depth, frame| {
            let info = match heap.info.get_frame_info(frame.id) {
                Some(info) => info,
                None => return,
            };
            for slot in info.mask.pointer_words(frame.slots.len()) {
                let target = frame.slots[slot];
                if result.is_err() || target == 0 {
                    continue;
                }
                result = (|| {
                    out.write_all(&[TAG_STACK_ROOT])?;
                    write_uvarint(out, mutator.id as u64)?;
                    write_uvarint(out, depth as u64)?;
                    write_uvarint(out, slot as u64)?;
                    write_uvarint(out, target as u64)
                })();
            }
        });
    });
    result?;

    out.write_all(&[TAG_EOF])?;
    out.flush()
}

/// Parse a dump written by [Heap::dump_heap](crate::heap::Heap::dump_heap).
pub fn read_dump(input: &mut impl Read) -> io::Result<HeapDump> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid("not a heap dump"));
    }
    let version = read_uvarint(input)?;
    if version != VERSION {
        return Err(invalid("unsupported heap dump version"));
    }

    let mut dump = HeapDump::default();
    loop {
        match read_u8(input)? {
            TAG_EOF => return Ok(dump),
            TAG_PARAMS => {
                dump.word_size = read_uvarint(input)?;
                dump.page_size = read_uvarint(input)?;
                dump.heap_live = read_uvarint(input)?;
                dump.cycles = read_uvarint(input)?;
            }
            TAG_TYPE => {
                let id = read_uvarint(input)? as u32;
                let name = read_string(input)?;
                let size = read_uvarint(input)?;
                dump.types.push(DumpType { id, name, size });
            }
            TAG_OBJECT => {
                let addr = read_uvarint(input)?;
                let type_id = read_uvarint(input)? as u32;
                let size = read_uvarint(input)?;
                let count = read_uvarint(input)?;
                let mut fields = Vec::with_capacity(count.min(1 << 16) as usize);
                for _ in 0..count {
                    let offset = read_uvarint(input)?;
                    let target = read_uvarint(input)?;
                    fields.push((offset, target));
                }
                dump.objects.push(DumpObject {
                    addr,
                    type_id,
                    size,
                    fields,
                });
            }
            TAG_GLOBAL_ROOT => {
                let index = read_uvarint(input)?;
                let target = read_uvarint(input)?;
                dump.roots.push(DumpRoot::Global { index, target });
            }
            TAG_STACK_ROOT => {
                let mutator = read_uvarint(input)?;
                let depth = read_uvarint(input)?;
                let slot = read_uvarint(input)?;
                let target = read_uvarint(input)?;
                dump.roots.push(DumpRoot::Stack {
                    mutator,
                    depth,
                    slot,
                    target,
                });
            }
            tag => return Err(invalid(&format!("unknown record tag {}", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            buf.clear();
            write_uvarint(&mut buf, value).unwrap();
            assert_eq!(read_uvarint(&mut &buf[..]).unwrap(), value);
        }
        write_uvarint(&mut buf, 300).unwrap();
        assert_eq!(&buf[buf.len() - 2..], &[0xac, 0x02]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(read_dump(&mut &b"NOTADUMP\x01\x00"[..]).is_err());
        let mut buf = MAGIC.to_vec();
        buf.push(VERSION as u8);
        buf.push(42);
        let err = read_dump(&mut &buf[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // truncated stream
        let mut buf = MAGIC.to_vec();
        buf.push(VERSION as u8);
        buf.push(TAG_OBJECT);
        assert!(read_dump(&mut &buf[..]).is_err());
    }
}
