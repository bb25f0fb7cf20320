//! Minimal `.class` file reader.
//!
//! The decoder spec treats the class-file parser as an external collaborator
//! "described only by the graph shape it supplies" (§1). Something in this
//! crate still has to walk `--class-path` and turn class files into
//! `(code bytes, exception table)` pairs for §4.1's `Cfg::build`, so this
//! module implements just enough of the JVM class file format (JVMS §4) to
//! extract a method's `Code` attribute: constant pool UTF8/NameAndType/
//! Methodref entries, the method table, and the `Code` attribute layout.
//! It does not interpret attributes the decoder never needs (debug info,
//! annotations, `StackMapTable`, etc).

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::bytecode::{Cfg, ExceptionHandler};

#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("I/O error reading class file: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic number {0:#x}, not a class file")]
    BadMagic(u32),
    #[error("constant pool index {0} out of range")]
    BadConstantIndex(u16),
    #[error("constant pool entry at index {0} has unexpected tag")]
    WrongConstantKind(u16),
    #[error("method {0} not found in class file")]
    MethodNotFound(String),
    #[error("method {0} has no Code attribute (abstract or native)")]
    NoCode(String),
    #[error(transparent)]
    Cfg(#[from] crate::bytecode::CfgError),
}

enum Constant {
    Utf8(String),
    Class { name_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    /// Any other entry we don't need the contents of, just its width in the pool.
    Other,
    /// The dummy slot that follows a Long/Double entry (JVMS 4.4.5).
    Unusable,
}

pub struct ClassFile {
    constants: Vec<Constant>,
    this_class_name: String,
    methods: Vec<MethodInfo>,
}

struct MethodInfo {
    name: String,
    descriptor: String,
    code: Option<(Vec<u8>, Vec<ExceptionHandler>)>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<ClassFile, ClassFileError> {
        let mut r = bytes;
        let magic = r.read_u32::<BigEndian>()?;
        if magic != 0xCAFEBABE {
            return Err(ClassFileError::BadMagic(magic));
        }
        let _minor = r.read_u16::<BigEndian>()?;
        let _major = r.read_u16::<BigEndian>()?;

        let cp_count = r.read_u16::<BigEndian>()?;
        let mut constants = Vec::with_capacity(cp_count as usize);
        constants.push(Constant::Other); // index 0 is unused
        let mut i = 1;
        while i < cp_count {
            let tag = r.read_u8()?;
            let c = match tag {
                1 => {
                    let len = r.read_u16::<BigEndian>()?;
                    let mut buf = vec![0u8; len as usize];
                    r.read_exact(&mut buf)?;
                    Constant::Utf8(String::from_utf8_lossy(&buf).into_owned())
                }
                7 => Constant::Class { name_index: r.read_u16::<BigEndian>()? },
                12 => Constant::NameAndType {
                    name_index: r.read_u16::<BigEndian>()?,
                    descriptor_index: r.read_u16::<BigEndian>()?,
                },
                3 | 4 => {
                    r.read_u32::<BigEndian>()?;
                    Constant::Other
                }
                5 | 6 => {
                    r.read_u64::<BigEndian>()?;
                    constants.push(Constant::Other);
                    i += 1;
                    // Longs/doubles occupy two pool slots (JVMS 4.4.5).
                    Constant::Unusable
                }
                9 | 10 | 11 => {
                    r.read_u16::<BigEndian>()?;
                    r.read_u16::<BigEndian>()?;
                    Constant::Other
                }
                8 | 16 | 19 | 20 => {
                    r.read_u16::<BigEndian>()?;
                    Constant::Other
                }
                15 => {
                    r.read_u8()?;
                    r.read_u16::<BigEndian>()?;
                    Constant::Other
                }
                17 | 18 => {
                    r.read_u16::<BigEndian>()?;
                    r.read_u16::<BigEndian>()?;
                    Constant::Other
                }
                other => return Err(ClassFileError::WrongConstantKind(other as u16)),
            };
            constants.push(c);
            i += 1;
        }

        let _access_flags = r.read_u16::<BigEndian>()?;
        let this_class = r.read_u16::<BigEndian>()?;
        let _super_class = r.read_u16::<BigEndian>()?;

        let iface_count = r.read_u16::<BigEndian>()?;
        for _ in 0..iface_count {
            r.read_u16::<BigEndian>()?;
        }

        let field_count = r.read_u16::<BigEndian>()?;
        for _ in 0..field_count {
            skip_member(&mut r)?;
        }

        let method_count = r.read_u16::<BigEndian>()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(read_method(&mut r, &constants)?);
        }

        let this_class_name = class_name_at(&constants, this_class)?;

        Ok(ClassFile { constants, this_class_name, methods })
    }

    pub fn this_class_name(&self) -> &str {
        &self.this_class_name
    }

    pub fn build_cfg(&self, name: &str, descriptor: &str) -> Result<Cfg, ClassFileError> {
        let m = self
            .methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
            .ok_or_else(|| ClassFileError::MethodNotFound(format!("{name}{descriptor}")))?;
        let (code, handlers) = m
            .code
            .as_ref()
            .ok_or_else(|| ClassFileError::NoCode(format!("{name}{descriptor}")))?;
        Ok(Cfg::build(code, handlers.clone())?)
    }
}

fn utf8_at(constants: &[Constant], index: u16) -> Result<&str, ClassFileError> {
    match constants.get(index as usize) {
        Some(Constant::Utf8(s)) => Ok(s),
        Some(_) => Err(ClassFileError::WrongConstantKind(index)),
        None => Err(ClassFileError::BadConstantIndex(index)),
    }
}

fn class_name_at(constants: &[Constant], index: u16) -> Result<String, ClassFileError> {
    match constants.get(index as usize) {
        Some(Constant::Class { name_index }) => Ok(utf8_at(constants, *name_index)?.to_owned()),
        Some(_) => Err(ClassFileError::WrongConstantKind(index)),
        None => Err(ClassFileError::BadConstantIndex(index)),
    }
}

fn skip_member(r: &mut &[u8]) -> Result<(), ClassFileError> {
    let _access_flags = r.read_u16::<BigEndian>()?;
    let _name_index = r.read_u16::<BigEndian>()?;
    let _descriptor_index = r.read_u16::<BigEndian>()?;
    let attr_count = r.read_u16::<BigEndian>()?;
    for _ in 0..attr_count {
        skip_attribute(r)?;
    }
    Ok(())
}

fn skip_attribute(r: &mut &[u8]) -> Result<(), ClassFileError> {
    let _name_index = r.read_u16::<BigEndian>()?;
    let len = r.read_u32::<BigEndian>()?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(())
}

fn read_method(r: &mut &[u8], constants: &[Constant]) -> Result<MethodInfo, ClassFileError> {
    let _access_flags = r.read_u16::<BigEndian>()?;
    let name_index = r.read_u16::<BigEndian>()?;
    let descriptor_index = r.read_u16::<BigEndian>()?;
    let name = utf8_at(constants, name_index)?.to_owned();
    let descriptor = utf8_at(constants, descriptor_index)?.to_owned();

    let attr_count = r.read_u16::<BigEndian>()?;
    let mut code = None;
    for _ in 0..attr_count {
        let name_idx = r.read_u16::<BigEndian>()?;
        let len = r.read_u32::<BigEndian>()?;
        let attr_name = utf8_at(constants, name_idx)?;
        if attr_name == "Code" {
            code = Some(read_code_attribute(r)?);
        } else {
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf)?;
        }
    }

    Ok(MethodInfo { name, descriptor, code })
}

fn read_code_attribute(r: &mut &[u8]) -> Result<(Vec<u8>, Vec<ExceptionHandler>), ClassFileError> {
    let _max_stack = r.read_u16::<BigEndian>()?;
    let _max_locals = r.read_u16::<BigEndian>()?;
    let code_length = r.read_u32::<BigEndian>()?;
    let mut code = vec![0u8; code_length as usize];
    r.read_exact(&mut code)?;

    let exception_table_length = r.read_u16::<BigEndian>()?;
    let mut handlers = Vec::with_capacity(exception_table_length as usize);
    for _ in 0..exception_table_length {
        let start_pc = r.read_u16::<BigEndian>()? as u32;
        let end_pc = r.read_u16::<BigEndian>()? as u32;
        let handler_pc = r.read_u16::<BigEndian>()? as u32;
        let catch_type = r.read_u16::<BigEndian>()?;
        handlers.push(ExceptionHandler { start_pc, end_pc, handler_pc, catch_type });
    }

    // Code attributes nest their own (LineNumberTable, StackMapTable, ...);
    // skip them, we only need code + exception table.
    let nested_attr_count = r.read_u16::<BigEndian>()?;
    for _ in 0..nested_attr_count {
        skip_attribute(r)?;
    }

    Ok((code, handlers))
}

/// Resolves class files by searching an ordered list of `--class-path`
/// directories, the way `javac`/`java` resolve an unnamed classpath.
pub struct ClassPath {
    dirs: Vec<PathBuf>,
    cache: HashMap<String, ClassFile>,
}

impl ClassPath {
    pub fn new(dirs: Vec<PathBuf>) -> ClassPath {
        ClassPath { dirs, cache: HashMap::new() }
    }

    pub fn load(&mut self, binary_class_name: &str) -> Result<&ClassFile, ClassFileError> {
        if !self.cache.contains_key(binary_class_name) {
            let bytes = self.read_class_bytes(binary_class_name)?;
            let class_file = ClassFile::parse(&bytes)?;
            self.cache.insert(binary_class_name.to_owned(), class_file);
        }
        Ok(self.cache.get(binary_class_name).unwrap())
    }

    fn read_class_bytes(&self, binary_class_name: &str) -> Result<Vec<u8>, ClassFileError> {
        let rel = format!("{}.class", binary_class_name.replace('.', "/"));
        for dir in &self.dirs {
            let candidate: PathBuf = Path::new(dir).join(&rel);
            if candidate.is_file() {
                return Ok(std::fs::read(candidate)?);
            }
        }
        Err(ClassFileError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("class {binary_class_name} not found on class-path"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = [0u8, 1, 2, 3];
        assert!(matches!(ClassFile::parse(&bytes), Err(ClassFileError::BadMagic(_))));
    }
}
