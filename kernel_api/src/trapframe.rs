//! Saved register state
//!
//! [`TrapFrame`] is what the kernel saves when an environment stops running.
//! [`UTrapframe`] is the record the kernel pushes onto the user exception
//! stack when it reflects a page fault to user level.

use serde::{Deserialize, Serialize};

/// User text segment selector (with RPL 3 applied by the kernel)
pub const GD_UT: u16 = 0x18;
/// User data segment selector
pub const GD_UD: u16 = 0x20;
/// Interrupt enable flag
pub const FL_IF: u32 = 0x200;

/// Page fault trap number
pub const T_PGFLT: u32 = 14;

/// Page fault error code: protection violation (page was present)
pub const FEC_PR: u32 = 0x1;
/// Page fault error code: fault caused by a write
pub const FEC_WR: u32 = 0x2;
/// Page fault error code: fault occurred in user mode
pub const FEC_U: u32 = 0x4;

/// General-purpose registers in `pushal` order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    /// Return-value register
    pub eax: u32,
}

impl PushRegs {
    const WORDS: usize = 8;

    fn words(&self) -> [u32; Self::WORDS] {
        [
            self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax,
        ]
    }

    fn from_words(w: &[u32]) -> Self {
        Self {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            oesp: w[3],
            ebx: w[4],
            edx: w[5],
            ecx: w[6],
            eax: w[7],
        }
    }
}

/// Register state saved on entry to the kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u16,
    pub ds: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
}

impl TrapFrame {
    /// A fresh user-mode frame with the given stack pointer and entry point
    pub fn user(esp: u32, eip: u32) -> Self {
        Self {
            es: GD_UD | 3,
            ds: GD_UD | 3,
            ss: GD_UD | 3,
            cs: GD_UT | 3,
            eflags: FL_IF,
            esp,
            eip,
            ..Self::default()
        }
    }

    /// True if the frame was saved while running at user privilege
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Forces user segment selectors and enables interrupts
    pub fn sanitize(&mut self) {
        self.ds = GD_UD | 3;
        self.es = GD_UD | 3;
        self.ss = GD_UD | 3;
        self.cs = GD_UT | 3;
        self.eflags |= FL_IF;
    }
}

/// Fault record pushed onto the user exception stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl UTrapframe {
    /// Size of the record in user memory
    pub const SIZE: u32 = 4 * (2 + PushRegs::WORDS as u32 + 3);

    /// Little-endian image as laid out on the exception stack
    pub fn encode(&self) -> Vec<u8> {
        let mut words = vec![self.fault_va, self.err];
        words.extend_from_slice(&self.regs.words());
        words.extend_from_slice(&[self.eip, self.eflags, self.esp]);
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let words: Vec<u32> = bytes[..Self::SIZE as usize]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(&words[2..10]),
            eip: words[10],
            eflags: words[11],
            esp: words[12],
        }
    }

    /// True if the fault was caused by a write
    pub fn is_write(&self) -> bool {
        self.err & FEC_WR != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_frame_selectors() {
        let tf = TrapFrame::user(0xEEBF_E000, 0x0080_0020);
        assert!(tf.is_user());
        assert_eq!(tf.cs, 0x1B);
        assert_eq!(tf.eflags & FL_IF, FL_IF);
    }

    #[test]
    fn test_sanitize_drops_kernel_privilege() {
        let mut tf = TrapFrame::default();
        assert!(!tf.is_user());
        tf.sanitize();
        assert!(tf.is_user());
        assert_eq!(tf.ss, GD_UD | 3);
    }

    #[test]
    fn test_utrapframe_layout() {
        assert_eq!(UTrapframe::SIZE, 52);
        let utf = UTrapframe {
            fault_va: 0xDEAD_B000,
            err: FEC_WR | FEC_U,
            regs: PushRegs {
                eax: 7,
                ..PushRegs::default()
            },
            eip: 0x80_1000,
            eflags: FL_IF,
            esp: 0xEEBF_DFF0,
        };
        let bytes = utf.encode();
        assert_eq!(bytes.len(), 52);
        assert_eq!(&bytes[0..4], &0xDEAD_B000u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &7u32.to_le_bytes());
        assert_eq!(UTrapframe::decode(&bytes), utf);
        assert!(utf.is_write());
    }
}
