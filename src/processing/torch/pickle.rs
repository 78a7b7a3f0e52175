//! Just enough of a pickle VM to read `data.pkl` from a `torch.save` archive.
//!
//! Objects are not reconstructed. The VM only tracks what it needs to find
//! tensors: persistent storage ids and `_rebuild_tensor_v2` calls. Anything
//! else becomes an opaque `Value::Object`.

use std::collections::{BTreeMap, HashMap};
use crate::utils::{OptimizerError, OptimizerResult};

/// Element type of a torch storage, from its pickled class name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageDtype {
    F32,
    F64,
    Other(String),
}

impl StorageDtype {
    pub fn from_class(name: &str) -> Self {
        match name {
            "FloatStorage" => Self::F32,
            "DoubleStorage" => Self::F64,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn element_size(&self) -> Option<usize> {
        match self {
            Self::F32 => Some(4),
            Self::F64 => Some(8),
            Self::Other(_) => None,
        }
    }
}

/// A storage referenced from the pickle via a persistent id.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRef {
    pub key: String,
    pub dtype: StorageDtype,
    pub numel: u64,
}

/// A tensor view over a storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRef {
    pub storage_key: String,
    pub offset: i64,
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone)]
enum Value {
    Mark,
    None,
    Int(i64),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global { module: String, name: String },
    Storage(StorageRef),
    /// Booleans, floats, byte strings, tensors and reconstructed objects.
    Object,
}

impl Value {
    fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, Value::Global { module: m, name: n } if m == module && n == name)
    }
}

/// Storages and tensors found in one pickle stream.
#[derive(Debug, Default)]
pub struct PickleScan {
    pub storages: BTreeMap<String, StorageRef>,
    pub tensors: Vec<TensorRef>,
}

mod op {
    pub const PROTO: u8 = 0x80;
    pub const FRAME: u8 = 0x95;
    pub const STOP: u8 = b'.';
    pub const MARK: u8 = b'(';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const NONE: u8 = b'N';
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const BINFLOAT: u8 = b'G';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BINSTRING: u8 = b'T';
    pub const BINUNICODE: u8 = b'X';
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const BINBYTES: u8 = b'B';
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_TUPLE: u8 = b')';
    pub const TUPLE: u8 = b't';
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const EMPTY_LIST: u8 = b']';
    pub const APPEND: u8 = b'a';
    pub const APPENDS: u8 = b'e';
    pub const LIST: u8 = b'l';
    pub const EMPTY_DICT: u8 = b'}';
    pub const DICT: u8 = b'd';
    pub const SETITEM: u8 = b's';
    pub const SETITEMS: u8 = b'u';
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const GLOBAL: u8 = b'c';
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const REDUCE: u8 = b'R';
    pub const BUILD: u8 = b'b';
    pub const NEWOBJ: u8 = 0x81;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const MEMOIZE: u8 = 0x94;
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const BINPERSID: u8 = b'Q';
}

struct Machine<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    memo: HashMap<u32, Value>,
    scan: PickleScan,
}

fn malformed(msg: impl Into<String>) -> OptimizerError {
    OptimizerError::format(format!("Malformed torch pickle: {}", msg.into()))
}

impl<'a> Machine<'a> {
    fn take(&mut self, n: usize) -> OptimizerResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.data.len());
        let end = end.ok_or_else(|| malformed(format!("unexpected end of data at {}", self.pos)))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> OptimizerResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> OptimizerResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> OptimizerResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> OptimizerResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn line(&mut self) -> OptimizerResult<String> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| malformed("unterminated GLOBAL line"))?;
        let text = String::from_utf8_lossy(&rest[..len]).to_string();
        self.pos += len + 1;
        Ok(text)
    }

    fn string(&mut self, len: usize) -> OptimizerResult<Value> {
        let bytes = self.take(len)?;
        Ok(Value::Str(String::from_utf8_lossy(bytes).to_string()))
    }

    fn bytes(&mut self, len: usize) -> OptimizerResult<Value> {
        self.take(len)?;
        Ok(Value::Object)
    }

    fn pop(&mut self) -> OptimizerResult<Value> {
        self.stack.pop().ok_or_else(|| malformed("stack underflow"))
    }

    fn top(&mut self) -> OptimizerResult<&mut Value> {
        self.stack.last_mut().ok_or_else(|| malformed("stack underflow"))
    }

    /// Pops everything above the topmost mark, and the mark itself.
    fn pop_to_mark(&mut self) -> OptimizerResult<Vec<Value>> {
        let mark = self
            .stack
            .iter()
            .rposition(|v| matches!(v, Value::Mark))
            .ok_or_else(|| malformed("missing MARK"))?;
        let items = self.stack.split_off(mark + 1);
        self.stack.pop();
        Ok(items)
    }

    fn memo_get(&self, idx: u32) -> OptimizerResult<Value> {
        self.memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| malformed(format!("memo slot {} is empty", idx)))
    }

    fn memo_put(&mut self, idx: u32) -> OptimizerResult<()> {
        let top = self.stack.last().cloned().ok_or_else(|| malformed("stack underflow"))?;
        self.memo.insert(idx, top);
        Ok(())
    }

    fn extend_top(&mut self, items: Vec<Value>) -> OptimizerResult<()> {
        match self.top()? {
            Value::List(list) => list.extend(items),
            Value::Dict(dict) => {
                let mut it = items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    dict.push((k, v));
                }
            }
            // Items added to sets or opaque objects (OrderedDict) are not needed.
            _ => {}
        }
        Ok(())
    }

    fn persistent_load(&mut self, pid: Value) -> OptimizerResult<Value> {
        let Value::Tuple(fields) = pid else {
            return Err(malformed("persistent id is not a tuple"));
        };
        match fields.as_slice() {
            [Value::Str(kind), Value::Global { name, .. }, Value::Str(key), _location, Value::Int(numel), ..]
                if kind == "storage" =>
            {
                let storage = StorageRef {
                    key: key.clone(),
                    dtype: StorageDtype::from_class(name),
                    numel: u64::try_from(*numel).map_err(|_| malformed("negative storage size"))?,
                };
                self.scan.storages.insert(storage.key.clone(), storage.clone());
                Ok(Value::Storage(storage))
            }
            _ => Err(malformed("unsupported persistent id")),
        }
    }

    fn rebuild_tensor(&mut self, args: &[Value]) -> Value {
        let (Some(Value::Storage(storage)), Some(Value::Int(offset)), Some(Value::Tuple(size))) =
            (args.first(), args.get(1), args.get(2))
        else {
            return Value::Object;
        };
        let shape: Option<Vec<i64>> = size
            .iter()
            .map(|d| match d {
                Value::Int(v) => Some(*v),
                _ => None,
            })
            .collect();
        let Some(shape) = shape else {
            return Value::Object;
        };
        self.scan.tensors.push(TensorRef {
            storage_key: storage.key.clone(),
            offset: *offset,
            shape,
        });
        Value::Object
    }

    fn reduce(&mut self, callable: Value, args: Value) -> Value {
        let Value::Tuple(args) = args else {
            return Value::Object;
        };
        if callable.is_global("torch._utils", "_rebuild_tensor_v2")
            || callable.is_global("torch._utils", "_rebuild_tensor")
        {
            return self.rebuild_tensor(&args);
        }
        if callable.is_global("torch._utils", "_rebuild_parameter")
            || callable.is_global("torch._utils", "_rebuild_parameter_with_state")
        {
            return args.into_iter().next().unwrap_or(Value::Object);
        }
        if callable.is_global("torch._tensor", "_rebuild_from_type_v2") {
            if let (Some(func), Some(Value::Tuple(inner))) = (args.first(), args.get(2)) {
                let func = func.clone();
                let inner = Value::Tuple(inner.clone());
                return self.reduce(func, inner);
            }
        }
        Value::Object
    }

    fn run(mut self) -> OptimizerResult<PickleScan> {
        loop {
            let opcode = self.u8()?;
            match opcode {
                op::PROTO => {
                    self.u8()?;
                }
                op::FRAME => {
                    self.u64()?;
                }
                op::STOP => return Ok(self.scan),
                op::MARK => self.stack.push(Value::Mark),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_to_mark()?;
                }
                op::DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                op::NONE => self.stack.push(Value::None),
                op::NEWTRUE | op::NEWFALSE => self.stack.push(Value::Object),
                op::BININT => {
                    let v = self.u32()? as i32;
                    self.stack.push(Value::Int(v as i64));
                }
                op::BININT1 => {
                    let v = self.u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                op::BININT2 => {
                    let v = self.u16()?;
                    self.stack.push(Value::Int(v as i64));
                }
                op::LONG1 | op::LONG4 => {
                    let n = if opcode == op::LONG1 { self.u8()? as usize } else { self.u32()? as usize };
                    let bytes = self.take(n)?;
                    self.stack.push(Value::Int(decode_long(bytes)?));
                }
                op::BINFLOAT => {
                    self.take(8)?;
                    self.stack.push(Value::Object);
                }
                op::SHORT_BINSTRING | op::SHORT_BINUNICODE => {
                    let n = self.u8()? as usize;
                    let v = self.string(n)?;
                    self.stack.push(v);
                }
                op::BINSTRING | op::BINUNICODE => {
                    let n = self.u32()? as usize;
                    let v = self.string(n)?;
                    self.stack.push(v);
                }
                op::BINUNICODE8 => {
                    let n = self.u64()? as usize;
                    let v = self.string(n)?;
                    self.stack.push(v);
                }
                op::SHORT_BINBYTES => {
                    let n = self.u8()? as usize;
                    let v = self.bytes(n)?;
                    self.stack.push(v);
                }
                op::BINBYTES => {
                    let n = self.u32()? as usize;
                    let v = self.bytes(n)?;
                    self.stack.push(v);
                }
                op::BINBYTES8 => {
                    let n = self.u64()? as usize;
                    let v = self.bytes(n)?;
                    self.stack.push(v);
                }
                op::EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_to_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(malformed("stack underflow"));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Value::Tuple(items));
                }
                op::EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                op::LIST => {
                    let items = self.pop_to_mark()?;
                    self.stack.push(Value::List(items));
                }
                op::APPEND => {
                    let item = self.pop()?;
                    self.extend_top(vec![item])?;
                }
                op::APPENDS | op::SETITEMS | op::ADDITEMS => {
                    let items = self.pop_to_mark()?;
                    self.extend_top(items)?;
                }
                op::EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
                op::DICT => {
                    let items = self.pop_to_mark()?;
                    self.stack.push(Value::Dict(Vec::new()));
                    self.extend_top(items)?;
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.extend_top(vec![key, value])?;
                }
                op::EMPTY_SET => self.stack.push(Value::Object),
                op::FROZENSET => {
                    self.pop_to_mark()?;
                    self.stack.push(Value::Object);
                }
                op::GLOBAL => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.stack.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.stack.push(Value::Global { module, name })
                        }
                        _ => return Err(malformed("STACK_GLOBAL needs two strings")),
                    }
                }
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let result = self.reduce(callable, args);
                    self.stack.push(result);
                }
                op::BUILD => {
                    // State is applied to the object below it; the object stays.
                    self.pop()?;
                }
                op::NEWOBJ => {
                    self.pop()?;
                    self.pop()?;
                    self.stack.push(Value::Object);
                }
                op::NEWOBJ_EX => {
                    self.pop()?;
                    self.pop()?;
                    self.pop()?;
                    self.stack.push(Value::Object);
                }
                op::BINPUT => {
                    let idx = self.u8()? as u32;
                    self.memo_put(idx)?;
                }
                op::LONG_BINPUT => {
                    let idx = self.u32()?;
                    self.memo_put(idx)?;
                }
                op::MEMOIZE => {
                    let idx = self.memo.len() as u32;
                    self.memo_put(idx)?;
                }
                op::BINGET => {
                    let idx = self.u8()? as u32;
                    let v = self.memo_get(idx)?;
                    self.stack.push(v);
                }
                op::LONG_BINGET => {
                    let idx = self.u32()?;
                    let v = self.memo_get(idx)?;
                    self.stack.push(v);
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    let storage = self.persistent_load(pid)?;
                    self.stack.push(storage);
                }
                other => {
                    return Err(malformed(format!(
                        "unsupported opcode 0x{:02x} at offset {}",
                        other,
                        self.pos - 1
                    )))
                }
            }
        }
    }
}

/// Little-endian two's complement integer of up to 8 bytes.
fn decode_long(bytes: &[u8]) -> OptimizerResult<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(malformed("integer wider than 64 bits"));
    }
    let fill = if bytes[bytes.len() - 1] & 0x80 != 0 { 0xff } else { 0x00 };
    let mut arr = [fill; 8];
    arr[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(arr))
}

/// Runs the pickle and reports the storages and tensors it references.
pub fn scan(data: &[u8]) -> OptimizerResult<PickleScan> {
    Machine {
        data,
        pos: 0,
        stack: Vec::new(),
        memo: HashMap::new(),
        scan: PickleScan::default(),
    }
    .run()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writes pickles the way `torch.save` lays out a state dict.
    #[derive(Default)]
    pub(crate) struct PickleWriter {
        pub(crate) out: Vec<u8>,
        memo: u32,
    }

    impl PickleWriter {
        pub(crate) fn new() -> Self {
            let mut w = Self::default();
            w.out.extend_from_slice(&[op::PROTO, 2]);
            w
        }

        fn op(&mut self, code: u8) -> &mut Self {
            self.out.push(code);
            self
        }

        fn global(&mut self, module: &str, name: &str) -> &mut Self {
            self.out.push(op::GLOBAL);
            self.out.extend_from_slice(module.as_bytes());
            self.out.push(b'\n');
            self.out.extend_from_slice(name.as_bytes());
            self.out.push(b'\n');
            self
        }

        fn str(&mut self, s: &str) -> &mut Self {
            self.out.push(op::BINUNICODE);
            self.out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            self.out.extend_from_slice(s.as_bytes());
            self
        }

        fn int(&mut self, v: i64) -> &mut Self {
            if (0..256).contains(&v) {
                self.out.extend_from_slice(&[op::BININT1, v as u8]);
            } else {
                self.out.push(op::BININT);
                self.out.extend_from_slice(&(v as i32).to_le_bytes());
            }
            self
        }

        fn put(&mut self) -> &mut Self {
            self.out.extend_from_slice(&[op::BINPUT, self.memo as u8]);
            self.memo += 1;
            self
        }

        pub(crate) fn begin_state_dict(&mut self) -> &mut Self {
            self.global("collections", "OrderedDict")
                .op(op::EMPTY_TUPLE)
                .op(op::REDUCE)
                .put()
                .op(op::MARK)
        }

        /// One `name: tensor` entry backed by its own storage.
        pub(crate) fn tensor(&mut self, name: &str, class: &str, key: &str, shape: &[i64]) -> &mut Self {
            let numel: i64 = shape.iter().product();
            self.str(name);
            self.global("torch._utils", "_rebuild_tensor_v2");
            self.op(op::MARK);
            self.op(op::MARK).str("storage").global("torch", class).str(key).str("cpu").int(numel);
            self.op(op::TUPLE).op(op::BINPERSID).put();
            self.int(0);
            self.op(op::MARK);
            for d in shape {
                self.int(*d);
            }
            self.op(op::TUPLE);
            self.op(op::MARK);
            let mut stride = 1;
            let mut strides = Vec::new();
            for d in shape.iter().rev() {
                strides.push(stride);
                stride *= d;
            }
            for s in strides.iter().rev() {
                self.int(*s);
            }
            self.op(op::TUPLE);
            self.op(op::NEWFALSE);
            self.global("collections", "OrderedDict").op(op::EMPTY_TUPLE).op(op::REDUCE);
            self.op(op::TUPLE).op(op::REDUCE).put();
            self
        }

        pub(crate) fn finish(&mut self) -> Vec<u8> {
            self.op(op::SETITEMS).op(op::STOP);
            std::mem::take(&mut self.out)
        }
    }

    #[test]
    fn finds_storages_and_tensor_shapes() {
        let pickle = PickleWriter::new()
            .begin_state_dict()
            .tensor("fc.weight", "FloatStorage", "0", &[4, 8])
            .tensor("fc.bias", "FloatStorage", "1", &[4])
            .tensor("steps", "LongStorage", "2", &[1])
            .finish();

        let scan = scan(&pickle).unwrap();
        assert_eq!(scan.storages.len(), 3);
        assert_eq!(scan.storages["0"].dtype, StorageDtype::F32);
        assert_eq!(scan.storages["0"].numel, 32);
        assert_eq!(scan.storages["2"].dtype, StorageDtype::Other("LongStorage".to_string()));
        assert_eq!(scan.tensors.len(), 3);
        assert_eq!(scan.tensors[0].shape, vec![4, 8]);
        assert_eq!(scan.tensors[1].storage_key, "1");
    }

    #[test]
    fn memo_get_reuses_storage() {
        let mut w = PickleWriter::new();
        w.begin_state_dict().tensor("a", "FloatStorage", "0", &[2, 2]);
        // Second tensor viewing the memoized storage (slot 1).
        w.str("b").global("torch._utils", "_rebuild_tensor_v2").op(op::MARK);
        w.out.extend_from_slice(&[op::BINGET, 1]);
        w.int(0).op(op::MARK).int(4).op(op::TUPLE).op(op::MARK).int(1).op(op::TUPLE);
        w.op(op::NEWFALSE).op(op::NONE).op(op::TUPLE).op(op::REDUCE);
        let pickle = w.finish();

        let scan = scan(&pickle).unwrap();
        assert_eq!(scan.storages.len(), 1);
        assert_eq!(scan.tensors.len(), 2);
        assert_eq!(scan.tensors[1].storage_key, "0");
        assert_eq!(scan.tensors[1].shape, vec![4]);
    }

    #[test]
    fn scalar_and_bytes_entries_are_skipped() {
        let mut w = PickleWriter::new();
        w.begin_state_dict().tensor("w", "FloatStorage", "0", &[2, 2]);
        w.str("training").op(op::NEWTRUE);
        w.str("lr").op(op::BINFLOAT);
        w.out.extend_from_slice(&0.01f64.to_be_bytes());
        w.str("blob").op(op::SHORT_BINBYTES);
        w.out.extend_from_slice(&[3, b'a', b'b', b'c']);
        let pickle = w.finish();

        let scan = scan(&pickle).unwrap();
        assert_eq!(scan.storages.len(), 1);
        assert_eq!(scan.tensors.len(), 1);
        assert_eq!(scan.tensors[0].shape, vec![2, 2]);
    }

    #[test]
    fn long_integers_decode_sign() {
        assert_eq!(decode_long(&[]).unwrap(), 0);
        assert_eq!(decode_long(&[0xff]).unwrap(), -1);
        assert_eq!(decode_long(&[0x00, 0x01]).unwrap(), 256);
        assert!(decode_long(&[0; 9]).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let pickle = PickleWriter::new()
            .begin_state_dict()
            .tensor("w", "FloatStorage", "0", &[2, 2])
            .finish();
        assert!(scan(&pickle[..pickle.len() - 3]).is_err());
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let err = scan(&[op::PROTO, 2, 0x01]).unwrap_err();
        assert!(err.to_string().contains("0x01"));
    }
}
