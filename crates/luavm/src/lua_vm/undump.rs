// Precompiled chunk loader. Every header byte must match this host
// exactly; any truncation, size mismatch or malformed section rejects
// the chunk with a syntax error rather than loading garbage.

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::{LocVar, LuaValue, Proto};
use crate::lua_vm::dump::{FORMAT, SIGNATURE, VARARG_ISVARARG, VERSION, header_bytes};
use crate::lua_vm::{LuaError, LuaResult, LuaVm};

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

type ReadResult<T> = Result<T, &'static str>;

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> ReadResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err("unexpected end of chunk");
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn byte(&mut self) -> ReadResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn int(&mut self) -> ReadResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn size(&mut self) -> ReadResult<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn number(&mut self) -> ReadResult<f64> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Length-prefixed string; the stored length counts a trailing NUL.
    fn string(&mut self) -> ReadResult<Option<&'a [u8]>> {
        let n = self.size()?;
        if n == 0 {
            return Ok(None);
        }
        let s = self.bytes(n as usize)?;
        Ok(Some(&s[..s.len() - 1]))
    }
}

/// Check the 12-byte header against this host's layout.
pub fn verify_header(bytes: &[u8]) -> Result<(), &'static str> {
    if bytes.len() < 12 {
        return Err("truncated header in precompiled chunk");
    }
    if &bytes[0..4] != SIGNATURE {
        return Err("bad signature in precompiled chunk");
    }
    if bytes[4] != VERSION || bytes[5] != FORMAT {
        return Err("version mismatch in precompiled chunk");
    }
    if bytes[..12] != header_bytes() {
        return Err("incompatible layout in precompiled chunk");
    }
    Ok(())
}

impl LuaVm {
    pub(crate) fn syntax_error(&mut self, msg: &str) -> LuaError {
        self.error_value = self.new_string_value(msg);
        LuaError::Syntax
    }
}

/// Load a precompiled chunk into a proto tree, interning its string
/// constants in the running state.
pub fn load_chunk(vm: &mut LuaVm, bytes: &[u8]) -> LuaResult<Rc<Proto>> {
    verify_header(bytes).map_err(|m| vm.syntax_error(m))?;
    let mut r = Reader {
        data: bytes,
        pos: 12,
    };
    let proto = load_function(vm, &mut r).map_err(|m| vm.syntax_error(m))?;
    Ok(Rc::new(proto))
}

fn load_function(vm: &mut LuaVm, r: &mut Reader<'_>) -> ReadResult<Proto> {
    let mut p = Proto::new();

    if let Some(src) = r.string()? {
        p.source = SmolStr::new(String::from_utf8_lossy(src));
    }
    p.line_defined = r.int()?;
    p.last_line_defined = r.int()?;
    p.nups = r.byte()?;
    p.num_params = r.byte()?;
    p.is_vararg = r.byte()? & VARARG_ISVARARG != 0;
    p.max_stack_size = r.byte()?;

    let ncode = r.int()? as usize;
    p.code = Vec::with_capacity(ncode);
    for _ in 0..ncode {
        p.code.push(r.int()?);
    }

    let nk = r.int()? as usize;
    p.constants = Vec::with_capacity(nk);
    for _ in 0..nk {
        let v = match r.byte()? {
            0 => LuaValue::Nil,
            1 => LuaValue::Boolean(r.byte()? != 0),
            3 => LuaValue::Number(r.number()?),
            4 => {
                let s = r.string()?.ok_or("bad string constant in chunk")?;
                let owned = s.to_vec();
                LuaValue::String(vm.intern(&owned))
            }
            _ => return Err("bad constant tag in chunk"),
        };
        p.constants.push(v);
    }

    let np = r.int()? as usize;
    p.protos = Vec::with_capacity(np);
    for _ in 0..np {
        p.protos.push(Rc::new(load_function(vm, r)?));
    }

    let nlines = r.int()? as usize;
    p.line_info = Vec::with_capacity(nlines);
    for _ in 0..nlines {
        p.line_info.push(r.int()?);
    }
    let nlocs = r.int()? as usize;
    p.loc_vars = Vec::with_capacity(nlocs);
    for _ in 0..nlocs {
        let name = r.string()?.map(|s| SmolStr::new(String::from_utf8_lossy(s)));
        let start_pc = r.int()?;
        let end_pc = r.int()?;
        p.loc_vars.push(LocVar {
            name: name.unwrap_or_default(),
            start_pc,
            end_pc,
        });
    }
    let nupnames = r.int()? as usize;
    p.upvalue_names = Vec::with_capacity(nupnames);
    for _ in 0..nupnames {
        let name = r.string()?.map(|s| SmolStr::new(String::from_utf8_lossy(s)));
        p.upvalue_names.push(name.unwrap_or_default());
    }

    Ok(p)
}
