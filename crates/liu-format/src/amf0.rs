//! AMF0 编解码.
//!
//! FLV 脚本 tag 使用 AMF0 序列化 `onMetaData` 事件: 一个字符串名称后跟一个
//! ECMA 数组. 这里只实现元数据中出现的类型, 属性保持写入顺序.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use liu_core::{LiuError, LiuResult};

/// AMF0 类型标记
pub mod markers {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const STRICT_ARRAY: u8 = 0x0A;
    pub const DATE: u8 = 0x0B;
    pub const LONG_STRING: u8 = 0x0C;
}

/// 嵌套深度上限, 防止恶意数据导致栈溢出
const MAX_DEPTH: usize = 16;

/// AMF0 值
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, AmfValue)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, AmfValue)>),
    StrictArray(Vec<AmfValue>),
    /// 毫秒时间戳与时区偏移 (分钟)
    Date { milliseconds: f64, timezone: i16 },
}

impl AmfValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// 对象或 ECMA 数组的属性
    pub fn as_properties(&self) -> Option<&[(String, AmfValue)]> {
        match self {
            Self::Object(props) | Self::EcmaArray(props) => Some(props),
            _ => None,
        }
    }

    /// 按名称查找属性
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_properties()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// 从字节流解析一个值
    pub fn parse<R: Read>(reader: &mut R) -> LiuResult<Self> {
        parse_value(reader, 0)
    }

    /// 序列化
    pub fn write<W: Write>(&self, writer: &mut W) -> LiuResult<()> {
        match self {
            Self::Number(n) => {
                writer.write_u8(markers::NUMBER)?;
                writer.write_f64::<BigEndian>(*n)?;
            }
            Self::Boolean(b) => {
                writer.write_u8(markers::BOOLEAN)?;
                writer.write_u8(u8::from(*b))?;
            }
            Self::String(s) => {
                if s.len() > u16::MAX as usize {
                    writer.write_u8(markers::LONG_STRING)?;
                    writer.write_u32::<BigEndian>(s.len() as u32)?;
                    writer.write_all(s.as_bytes())?;
                } else {
                    writer.write_u8(markers::STRING)?;
                    write_short_string(writer, s)?;
                }
            }
            Self::Object(props) => {
                writer.write_u8(markers::OBJECT)?;
                write_properties(writer, props)?;
            }
            Self::Null => writer.write_u8(markers::NULL)?,
            Self::Undefined => writer.write_u8(markers::UNDEFINED)?,
            Self::EcmaArray(props) => {
                writer.write_u8(markers::ECMA_ARRAY)?;
                writer.write_u32::<BigEndian>(props.len() as u32)?;
                write_properties(writer, props)?;
            }
            Self::StrictArray(values) => {
                writer.write_u8(markers::STRICT_ARRAY)?;
                writer.write_u32::<BigEndian>(values.len() as u32)?;
                for value in values {
                    value.write(writer)?;
                }
            }
            Self::Date {
                milliseconds,
                timezone,
            } => {
                writer.write_u8(markers::DATE)?;
                writer.write_f64::<BigEndian>(*milliseconds)?;
                writer.write_i16::<BigEndian>(*timezone)?;
            }
        }
        Ok(())
    }
}

fn corrupt(err: std::io::Error) -> LiuError {
    LiuError::CorruptStream(format!("AMF0: 数据截断: {err}"))
}

fn parse_value<R: Read>(reader: &mut R, depth: usize) -> LiuResult<AmfValue> {
    if depth > MAX_DEPTH {
        return Err(LiuError::CorruptStream("AMF0: 嵌套过深".into()));
    }
    let marker = reader.read_u8().map_err(corrupt)?;
    let value = match marker {
        markers::NUMBER => AmfValue::Number(reader.read_f64::<BigEndian>().map_err(corrupt)?),
        markers::BOOLEAN => AmfValue::Boolean(reader.read_u8().map_err(corrupt)? != 0),
        markers::STRING => AmfValue::String(read_short_string(reader)?),
        markers::LONG_STRING => {
            let len = reader.read_u32::<BigEndian>().map_err(corrupt)? as usize;
            AmfValue::String(read_string(reader, len)?)
        }
        markers::OBJECT => AmfValue::Object(parse_properties(reader, depth)?),
        markers::NULL => AmfValue::Null,
        markers::UNDEFINED => AmfValue::Undefined,
        markers::ECMA_ARRAY => {
            // 声明的元素数量不可靠, 以结束标记为准
            reader.read_u32::<BigEndian>().map_err(corrupt)?;
            AmfValue::EcmaArray(parse_properties(reader, depth)?)
        }
        markers::STRICT_ARRAY => {
            let count = reader.read_u32::<BigEndian>().map_err(corrupt)?;
            let mut values = Vec::new();
            for _ in 0..count {
                values.push(parse_value(reader, depth + 1)?);
            }
            AmfValue::StrictArray(values)
        }
        markers::DATE => AmfValue::Date {
            milliseconds: reader.read_f64::<BigEndian>().map_err(corrupt)?,
            timezone: reader.read_i16::<BigEndian>().map_err(corrupt)?,
        },
        other => {
            return Err(LiuError::Unsupported(format!(
                "AMF0: 不支持的类型标记 0x{other:02X}"
            )));
        }
    };
    Ok(value)
}

fn parse_properties<R: Read>(reader: &mut R, depth: usize) -> LiuResult<Vec<(String, AmfValue)>> {
    let mut props = Vec::new();
    loop {
        let key = read_short_string(reader)?;
        if key.is_empty() {
            let end = reader.read_u8().map_err(corrupt)?;
            if end != markers::OBJECT_END {
                return Err(LiuError::CorruptStream(format!(
                    "AMF0: 缺少对象结束标记, 实际 0x{end:02X}"
                )));
            }
            return Ok(props);
        }
        let value = parse_value(reader, depth + 1)?;
        props.push((key, value));
    }
}

fn read_short_string<R: Read>(reader: &mut R) -> LiuResult<String> {
    let len = reader.read_u16::<BigEndian>().map_err(corrupt)? as usize;
    read_string(reader, len)
}

fn read_string<R: Read>(reader: &mut R, len: usize) -> LiuResult<String> {
    let mut buf = Vec::new();
    reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(corrupt)?;
    if buf.len() != len {
        return Err(LiuError::CorruptStream(format!(
            "AMF0: 字符串截断, 需要 {len} 字节, 实有 {}",
            buf.len()
        )));
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn write_short_string<W: Write>(writer: &mut W, s: &str) -> LiuResult<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| LiuError::InvalidArgument(format!("AMF0: 属性名过长: {} 字节", s.len())))?;
    writer.write_u16::<BigEndian>(len)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn write_properties<W: Write>(writer: &mut W, props: &[(String, AmfValue)]) -> LiuResult<()> {
    for (key, value) in props {
        write_short_string(writer, key)?;
        value.write(writer)?;
    }
    writer.write_u16::<BigEndian>(0)?;
    writer.write_u8(markers::OBJECT_END)?;
    Ok(())
}

/// 解析脚本 tag: 事件名 + 参数
pub fn parse_script_data(data: &[u8]) -> LiuResult<(String, AmfValue)> {
    let mut reader = data;
    let name = match AmfValue::parse(&mut reader)? {
        AmfValue::String(name) => name,
        other => {
            return Err(LiuError::CorruptStream(format!(
                "AMF0: 脚本 tag 事件名应为字符串, 实际 {other:?}"
            )));
        }
    };
    let value = AmfValue::parse(&mut reader)?;
    Ok((name, value))
}

/// 序列化脚本 tag
pub fn write_script_data(name: &str, value: &AmfValue) -> LiuResult<Vec<u8>> {
    let mut out = Vec::new();
    AmfValue::String(name.to_string()).write(&mut out)?;
    value.write(&mut out)?;
    Ok(out)
}
