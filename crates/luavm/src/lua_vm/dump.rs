// Precompiled chunk writer. Layout: a 12-byte header describing the
// host's sizes and endianness, then the root function recursively.
// Strings are length-prefixed with a trailing NUL counted in the
// length, zero meaning absent; all multi-byte fields are little-endian
// with the widths declared in the header.

use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::LuaVm;

pub const SIGNATURE: &[u8; 4] = b"\x1bLua";
pub const VERSION: u8 = 0x51;
pub const FORMAT: u8 = 0;

/// is_vararg flag bit in the chunk format.
pub const VARARG_ISVARARG: u8 = 2;

pub fn header_bytes() -> [u8; 12] {
    [
        SIGNATURE[0],
        SIGNATURE[1],
        SIGNATURE[2],
        SIGNATURE[3],
        VERSION,
        FORMAT,
        1, // little endian
        4, // sizeof(int)
        8, // sizeof(size_t)
        4, // sizeof(Instruction)
        8, // sizeof(number)
        0, // numbers are floating point
    ]
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn int(&mut self, n: u32) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn size(&mut self, n: u64) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn number(&mut self, n: f64) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.size(0),
            Some(bytes) => {
                self.size(bytes.len() as u64 + 1);
                self.out.extend_from_slice(bytes);
                self.byte(0);
            }
        }
    }
}

/// Serialize a proto (and its nested protos) into a loadable chunk.
/// `strip` drops the three debug sections.
pub fn dump_proto(vm: &LuaVm, proto: &Proto, strip: bool) -> Vec<u8> {
    let mut w = Writer {
        out: header_bytes().to_vec(),
    };
    dump_function(vm, proto, strip, &mut w);
    w.out
}

fn dump_function(vm: &LuaVm, p: &Proto, strip: bool, w: &mut Writer) {
    if strip {
        w.string(None);
    } else {
        w.string(Some(p.source.as_bytes()));
    }
    w.int(p.line_defined);
    w.int(p.last_line_defined);
    w.byte(p.nups);
    w.byte(p.num_params);
    w.byte(if p.is_vararg { VARARG_ISVARARG } else { 0 });
    w.byte(p.max_stack_size);

    w.int(p.code.len() as u32);
    for &i in &p.code {
        w.int(i);
    }

    w.int(p.constants.len() as u32);
    for k in &p.constants {
        match k {
            LuaValue::Nil => w.byte(0),
            LuaValue::Boolean(b) => {
                w.byte(1);
                w.byte(*b as u8);
            }
            LuaValue::Number(n) => {
                w.byte(3);
                w.number(*n);
            }
            LuaValue::String(id) => {
                w.byte(4);
                w.string(Some(vm.pool.string(*id).as_bytes()));
            }
            // the compiler only produces the four constant kinds above
            _ => w.byte(0),
        }
    }

    w.int(p.protos.len() as u32);
    for child in &p.protos {
        dump_function(vm, child, strip, w);
    }

    if strip {
        w.int(0);
        w.int(0);
        w.int(0);
    } else {
        w.int(p.line_info.len() as u32);
        for &l in &p.line_info {
            w.int(l);
        }
        w.int(p.loc_vars.len() as u32);
        for lv in &p.loc_vars {
            w.string(Some(lv.name.as_bytes()));
            w.int(lv.start_pc);
            w.int(lv.end_pc);
        }
        w.int(p.upvalue_names.len() as u32);
        for name in &p.upvalue_names {
            w.string(Some(name.as_bytes()));
        }
    }
}
