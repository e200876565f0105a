//! PEI Dependency Expression (DEPEX) support
//!
//! This module provides a parser and a bounded, side-effect free evaluator for PEI dependency expressions.
//!
//! ## Examples
//!
//! ```
//! use patina_internal_pei_depex::Depex;
//!
//! // TRUE NOT END
//! let depex = Depex::from([0x06u8, 0x05, 0x08].as_slice());
//! assert_eq!(depex.eval(|_| false), Ok(false));
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::{fmt, mem};
use r_efi::efi;
use uuid::Uuid;

/// The size of a GUID in bytes
const GUID_SIZE: usize = mem::size_of::<efi::Guid>();

/// Depth of the evaluation stack. Expressions that need more are rejected.
pub const DEPEX_STACK_DEPTH: usize = 64;

/// A PEI dependency expression opcode
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// DXE/MM only. Invalid in a PEI depex.
    Before(Uuid),
    /// DXE/MM only. Invalid in a PEI depex.
    After(Uuid),
    /// Pushes whether the PPI named by the GUID is installed.
    Push(Uuid),
    /// A logical AND operation of the two operands on the top of the stack.
    And,
    /// A logical OR operation of the two operands on the top of the stack.
    Or,
    /// A logical NOT operation of the operand on the top of the stack.
    Not,
    /// Pushes a true value onto the stack.
    True,
    /// Pushes a false value onto the stack.
    False,
    /// The End opcode is the last opcode in the expression.
    End,
    /// DXE only. Invalid in a PEI depex.
    Sor,
    /// An opcode value outside the PI defined set.
    Unknown(u8),
    /// A known opcode with an unexpected payload length.
    Malformed {
        /// The unhandled opcode value.
        opcode: u8,
        /// The length of the payload sent with the opcode.
        len: usize,
    },
}

/// Reasons a dependency expression cannot produce a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepexError {
    /// An operator found fewer operands on the stack than it needs.
    StackUnderflow,
    /// The expression pushes more than [`DEPEX_STACK_DEPTH`] values.
    StackOverflow,
    /// An opcode byte that is not defined by the PI specification.
    UnknownOpcode(u8),
    /// An opcode that is defined, but not for PEI (BEFORE, AFTER, SOR).
    UnsupportedOpcode(u8),
    /// A PUSH whose GUID operand is truncated.
    Malformed(u8),
    /// END was reached with a stack depth other than one.
    UnbalancedEnd(usize),
    /// The expression ended without an END opcode.
    MissingEnd,
}

impl fmt::Display for DepexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepexError::StackUnderflow => write!(f, "depex stack underflow"),
            DepexError::StackOverflow => write!(f, "depex stack overflow"),
            DepexError::UnknownOpcode(op) => write!(f, "unknown depex opcode {op:#04x}"),
            DepexError::UnsupportedOpcode(op) => write!(f, "opcode {op:#04x} is not valid in a PEI depex"),
            DepexError::Malformed(op) => write!(f, "opcode {op:#04x} is missing its GUID operand"),
            DepexError::UnbalancedEnd(depth) => write!(f, "END reached with {depth} values on the stack"),
            DepexError::MissingEnd => write!(f, "depex has no END opcode"),
        }
    }
}

/// Converts a UUID to an EFI GUID.
fn guid_from_uuid(uuid: &Uuid) -> efi::Guid {
    let (time_low, time_mid, time_hi, rest) = uuid.as_fields();
    let node = [rest[2], rest[3], rest[4], rest[5], rest[6], rest[7]];
    efi::Guid::from_fields(time_low, time_mid, time_hi, rest[0], rest[1], &node)
}

/// Converts a byte slice to a GUID.
fn uuid_from_slice(slice: Option<&[u8]>) -> Option<Uuid> {
    Uuid::from_slice_le(slice?).ok()
}

impl<'a> From<&'a [u8]> for Opcode {
    /// Creates an Opcode from a byte slice.
    fn from(bytes: &'a [u8]) -> Self {
        let guid_operand = |opcode: u8| match uuid_from_slice(bytes.get(1..GUID_SIZE + 1)) {
            Some(uuid) => Ok(uuid),
            None => Err(Opcode::Malformed { opcode, len: bytes.len() - 1 }),
        };
        match bytes[0] {
            0x00 => guid_operand(0x00).map_or_else(|malformed| malformed, Opcode::Before),
            0x01 => guid_operand(0x01).map_or_else(|malformed| malformed, Opcode::After),
            0x02 => guid_operand(0x02).map_or_else(|malformed| malformed, Opcode::Push),
            0x03 => Opcode::And,
            0x04 => Opcode::Or,
            0x05 => Opcode::Not,
            0x06 => Opcode::True,
            0x07 => Opcode::False,
            0x08 => Opcode::End,
            0x09 => Opcode::Sor,
            other => Opcode::Unknown(other),
        }
    }
}

impl Opcode {
    fn byte_size(&self) -> usize {
        match *self {
            Opcode::Before(_) | Opcode::After(_) | Opcode::Push(_) => 1 + GUID_SIZE,
            // A truncated operand consumes the rest of the expression.
            Opcode::Malformed { len, .. } => 1 + len,
            _ => 1,
        }
    }
}

/// A PEI dependency expression (DEPEX)
#[derive(Debug, Clone, PartialEq)]
pub struct Depex {
    expression: Vec<Opcode>,
}

impl From<&[u8]> for Depex {
    fn from(value: &[u8]) -> Self {
        Self { expression: DepexParser::new(value).collect() }
    }
}

impl From<Vec<u8>> for Depex {
    fn from(value: Vec<u8>) -> Self {
        Self::from(value.as_slice())
    }
}

impl From<&[Opcode]> for Depex {
    fn from(value: &[Opcode]) -> Self {
        Self { expression: value.to_vec() }
    }
}

/// Fixed-depth operand stack.
struct EvalStack {
    values: Vec<bool>,
    depth: usize,
}

impl EvalStack {
    fn new(depth: usize) -> Self {
        Self { values: Vec::with_capacity(depth), depth }
    }

    fn push(&mut self, value: bool) -> Result<(), DepexError> {
        if self.values.len() >= self.depth {
            return Err(DepexError::StackOverflow);
        }
        self.values.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<bool, DepexError> {
        self.values.pop().ok_or(DepexError::StackUnderflow)
    }
}

impl fmt::Debug for EvalStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values.iter().rev()).finish()
    }
}

impl Depex {
    /// Evaluates the expression with a stack of [`DEPEX_STACK_DEPTH`] entries.
    ///
    /// `is_installed` answers whether a PPI GUID is currently installed. It is consulted once per PUSH, in expression
    /// order, and is the only thing the evaluator observes.
    pub fn eval<F>(&self, is_installed: F) -> Result<bool, DepexError>
    where
        F: Fn(&efi::Guid) -> bool,
    {
        self.eval_with_depth(DEPEX_STACK_DEPTH, is_installed)
    }

    /// Evaluates the expression with a stack of `depth` entries.
    pub fn eval_with_depth<F>(&self, depth: usize, is_installed: F) -> Result<bool, DepexError>
    where
        F: Fn(&efi::Guid) -> bool,
    {
        let mut stack = EvalStack::new(depth);
        log::trace!("Depex:");
        for opcode in self.expression.iter() {
            match opcode {
                Opcode::Push(uuid) => {
                    stack.push(is_installed(&guid_from_uuid(uuid)))?;
                    log::trace!("  {opcode:x?} => stack ->{stack:?}");
                }
                Opcode::And => {
                    let operator1 = stack.pop()?;
                    let operator2 = stack.pop()?;
                    stack.push(operator1 && operator2)?;
                    log::trace!("  {opcode:x?}({operator1:?},{operator2:?}) => stack ->{stack:?}");
                }
                Opcode::Or => {
                    let operator1 = stack.pop()?;
                    let operator2 = stack.pop()?;
                    stack.push(operator1 || operator2)?;
                    log::trace!("  {opcode:x?}({operator1:?},{operator2:?}) => stack ->{stack:?}");
                }
                Opcode::Not => {
                    let operator = stack.pop()?;
                    stack.push(!operator)?;
                    log::trace!("  {opcode:x?}({operator:?}) => stack ->{stack:?}");
                }
                Opcode::True => {
                    stack.push(true)?;
                    log::trace!("  {opcode:x?} => stack ->{stack:?}");
                }
                Opcode::False => {
                    stack.push(false)?;
                    log::trace!("  {opcode:x?} => stack ->{stack:?}");
                }
                Opcode::End => {
                    if stack.values.len() != 1 {
                        log::error!("Depex END with unbalanced stack {stack:?}");
                        return Err(DepexError::UnbalancedEnd(stack.values.len()));
                    }
                    let result = stack.pop()?;
                    log::trace!("  {opcode:x?} => final result: {result:?}");
                    return Ok(result);
                }
                Opcode::Before(_) => return Err(DepexError::UnsupportedOpcode(0x00)),
                Opcode::After(_) => return Err(DepexError::UnsupportedOpcode(0x01)),
                Opcode::Sor => return Err(DepexError::UnsupportedOpcode(0x09)),
                Opcode::Unknown(op) => {
                    log::error!("Depex contains unknown opcode {op:#04x}");
                    return Err(DepexError::UnknownOpcode(*op));
                }
                Opcode::Malformed { opcode, len } => {
                    log::error!("Opcode [0x{opcode:x?}] expects a guid, only has a length of: {len}");
                    return Err(DepexError::Malformed(*opcode));
                }
            }
        }
        Err(DepexError::MissingEnd)
    }
}

struct DepexParser<'a> {
    expression: &'a [u8],
    index: usize,
}

impl<'a> DepexParser<'a> {
    fn new(expression: &'a [u8]) -> Self {
        Self { expression, index: 0 }
    }
}

impl Iterator for DepexParser<'_> {
    type Item = Opcode;

    /// Iterates over the DEPEX expression, returning the next Opcode.
    fn next(&mut self) -> Option<Opcode> {
        if self.index >= self.expression.len() {
            return None;
        }

        let opcode = Opcode::from(&self.expression[self.index..]);
        self.index += opcode.byte_size();
        Some(opcode)
    }
}
