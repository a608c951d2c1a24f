//! Script verification: a minimal stack machine over spending conditions
//!
//! The opcode surface is limited to push-data, NOP, DROP, DUP, EQUAL and
//! EQUALVERIFY, SHA256, HASH160, CHECKSIG and CHECKSIGVERIFY. An unknown
//! opcode or a stack underflow invalidates the transaction outright.

use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, Verification};
use sha2::{Digest, Sha256};

use crate::constants::{MAX_SCRIPT_OPS, MAX_SCRIPT_SIZE, MAX_STACK_SIZE};
use crate::error::{ChainError, Result};
use crate::params::ValidationPolicy;
use crate::types::{Hash, Transaction};
use crate::wire;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_NOP: u8 = 0x61;
const OP_DROP: u8 = 0x75;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_SHA256: u8 = 0xa8;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;

/// Transaction context a CHECKSIG executes against.
struct SigContext<'a> {
    tx: &'a Transaction,
    input_index: usize,
    /// Script substituted into the signed input when hashing; the locking
    /// script of the output being spent.
    subscript: &'a [u8],
}

/// Append a minimal push of `data` to a script.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        1..=0x4b => {
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
        _ => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(data.len() as u32).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// Verify one input's unlocking script against the locking script of the
/// output it spends: the unlocking script runs first, the locking script
/// continues on the same stack, and exactly one truthy value must remain.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    prev_script_public_key: &[u8],
    policy: &ValidationPolicy,
) -> Result<()> {
    let input = tx.inputs.get(input_index).ok_or_else(|| {
        ChainError::validation(format!("no input at index {input_index} to verify"))
    })?;

    let secp = Secp256k1::verification_only();
    let ctx = SigContext {
        tx,
        input_index,
        subscript: prev_script_public_key,
    };

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(&secp, &input.script_signature, &mut stack, &ctx, policy)?;
    eval_script(&secp, prev_script_public_key, &mut stack, &ctx, policy)?;

    match stack.as_slice() {
        [top] if is_truthy(top) => Ok(()),
        _ => Err(ChainError::validation(format!(
            "script left {} item(s) on the stack, wanted one truthy value",
            stack.len()
        ))),
    }
}

fn is_truthy(value: &[u8]) -> bool {
    value.iter().any(|&byte| byte != 0)
}

fn pop(stack: &mut Vec<Vec<u8>>, opcode: &str) -> Result<Vec<u8>> {
    stack
        .pop()
        .ok_or_else(|| ChainError::validation(format!("stack underflow in {opcode}")))
}

fn eval_script<C: Verification>(
    secp: &Secp256k1<C>,
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    ctx: &SigContext,
    policy: &ValidationPolicy,
) -> Result<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ChainError::validation(format!(
            "script of {} bytes exceeds the {MAX_SCRIPT_SIZE}-byte limit",
            script.len()
        )));
    }

    let mut op_count = 0usize;
    let mut pc = 0usize;
    while pc < script.len() {
        let opcode = script[pc];
        pc += 1;

        // Push-data range carries the length in the opcode itself.
        if (0x01..=0x4b).contains(&opcode) {
            push_bytes(script, &mut pc, opcode as usize, stack)?;
            continue;
        }

        match opcode {
            OP_0 => stack.push(Vec::new()),
            OP_PUSHDATA1 => {
                let len = read_push_len(script, &mut pc, 1)?;
                push_bytes(script, &mut pc, len, stack)?;
            }
            OP_PUSHDATA2 => {
                let len = read_push_len(script, &mut pc, 2)?;
                push_bytes(script, &mut pc, len, stack)?;
            }
            OP_PUSHDATA4 => {
                let len = read_push_len(script, &mut pc, 4)?;
                push_bytes(script, &mut pc, len, stack)?;
            }
            OP_1..=OP_16 => stack.push(vec![opcode - OP_1 + 1]),
            _ => {
                op_count += 1;
                if op_count > MAX_SCRIPT_OPS {
                    return Err(ChainError::validation("script operation limit exceeded"));
                }
                execute_opcode(secp, opcode, stack, ctx, policy)?;
            }
        }

        if stack.len() > MAX_STACK_SIZE {
            return Err(ChainError::validation("script stack overflow"));
        }
    }
    Ok(())
}

fn read_push_len(script: &[u8], pc: &mut usize, width: usize) -> Result<usize> {
    if *pc + width > script.len() {
        return Err(ChainError::validation("truncated push-data length"));
    }
    let mut len = 0usize;
    for i in 0..width {
        len |= (script[*pc + i] as usize) << (8 * i);
    }
    *pc += width;
    Ok(len)
}

fn push_bytes(script: &[u8], pc: &mut usize, len: usize, stack: &mut Vec<Vec<u8>>) -> Result<()> {
    if *pc + len > script.len() {
        return Err(ChainError::validation("push-data runs past end of script"));
    }
    stack.push(script[*pc..*pc + len].to_vec());
    *pc += len;
    Ok(())
}

fn execute_opcode<C: Verification>(
    secp: &Secp256k1<C>,
    opcode: u8,
    stack: &mut Vec<Vec<u8>>,
    ctx: &SigContext,
    policy: &ValidationPolicy,
) -> Result<()> {
    match opcode {
        OP_NOP => {}
        OP_DROP => {
            pop(stack, "OP_DROP")?;
        }
        OP_DUP => {
            let top = stack
                .last()
                .cloned()
                .ok_or_else(|| ChainError::validation("stack underflow in OP_DUP"))?;
            stack.push(top);
        }
        OP_EQUAL => {
            let a = pop(stack, "OP_EQUAL")?;
            let b = pop(stack, "OP_EQUAL")?;
            stack.push(if a == b { vec![1] } else { Vec::new() });
        }
        OP_EQUALVERIFY => {
            let a = pop(stack, "OP_EQUALVERIFY")?;
            let b = pop(stack, "OP_EQUALVERIFY")?;
            if a != b {
                return Err(ChainError::validation("OP_EQUALVERIFY failed"));
            }
        }
        OP_SHA256 => {
            let item = pop(stack, "OP_SHA256")?;
            stack.push(Sha256::digest(&item).to_vec());
        }
        OP_HASH160 => {
            let item = pop(stack, "OP_HASH160")?;
            let sha = Sha256::digest(&item);
            stack.push(Ripemd160::digest(sha).to_vec());
        }
        OP_CHECKSIG => {
            let pubkey = pop(stack, "OP_CHECKSIG")?;
            let signature = pop(stack, "OP_CHECKSIG")?;
            let ok = check_signature(secp, &signature, &pubkey, ctx, policy);
            stack.push(if ok { vec![1] } else { Vec::new() });
        }
        OP_CHECKSIGVERIFY => {
            let pubkey = pop(stack, "OP_CHECKSIGVERIFY")?;
            let signature = pop(stack, "OP_CHECKSIGVERIFY")?;
            if !check_signature(secp, &signature, &pubkey, ctx, policy) {
                return Err(ChainError::validation("OP_CHECKSIGVERIFY failed"));
            }
        }
        unknown => {
            return Err(ChainError::validation(format!(
                "unknown opcode {unknown:#04x}"
            )));
        }
    }
    Ok(())
}

/// The hash an input's signature commits to: every other input's unlocking
/// script blanked, the signed input's replaced by the subscript, the whole
/// transaction serialized with the 4-byte hash type appended, then
/// double-SHA-256.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    hash_type: u8,
) -> Hash {
    let mut blanked = tx.clone();
    for (index, input) in blanked.inputs.iter_mut().enumerate() {
        input.script_signature = if index == input_index {
            subscript.to_vec()
        } else {
            Vec::new()
        };
    }
    let mut bytes = wire::serialize_transaction(&blanked);
    bytes.extend_from_slice(&(hash_type as u32).to_le_bytes());
    wire::double_sha256(&bytes)
}

fn check_signature<C: Verification>(
    secp: &Secp256k1<C>,
    signature_bytes: &[u8],
    pubkey_bytes: &[u8],
    ctx: &SigContext,
    policy: &ValidationPolicy,
) -> bool {
    if policy.bypass_signature_verification {
        return true;
    }

    // The trailing byte of the pushed signature selects the hash type.
    let Some((&hash_type, der)) = signature_bytes.split_last() else {
        return false;
    };
    let Ok(signature) = Signature::from_der(der) else {
        return false;
    };
    let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
        return false;
    };

    let sighash = signature_hash(ctx.tx, ctx.input_index, ctx.subscript, hash_type);
    let Ok(message) = Message::from_digest_slice(&sighash) else {
        return false;
    };
    secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
}
