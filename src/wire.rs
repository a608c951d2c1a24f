//! Bit-exact consensus wire encoding
//!
//! Fixed-width integers are little-endian at their natural width, hashes are
//! 32 bytes in internal (little-endian) byte order, and counts use the
//! compact varint encoding. Block and transaction hashes are defined over
//! these exact bytes, so nothing here may change without breaking hash
//! stability.

use bitcoin_hashes::{sha256d, Hash as _};

use crate::constants::{VARINT_U16_MARKER, VARINT_U32_MARKER, VARINT_U64_MARKER};
use crate::error::{ChainError, Result};
use crate::types::{Block, BlockHeader, ByteString, Hash, OutPoint, Transaction, TxInput, TxOutput};

/// SHA256(SHA256(data))
pub fn double_sha256(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// Block hash: double-SHA-256 of the 80-byte header serialization.
pub fn header_hash(header: &BlockHeader) -> Hash {
    double_sha256(&serialize_header(header))
}

/// Transaction hash: double-SHA-256 of the transaction serialization.
pub fn transaction_hash(tx: &Transaction) -> Hash {
    double_sha256(&serialize_transaction(tx))
}

/// Hex display convention: byte-reversed, as block explorers print hashes.
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a display-order (byte-reversed) hex hash into internal byte order.
pub fn hash_from_hex(s: &str) -> Result<Hash> {
    let bytes = hex::decode(s).map_err(|e| ChainError::structural(format!("bad hash hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(ChainError::structural(format!(
            "hash hex must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Ok(hash)
}

pub fn write_var_int(buf: &mut Vec<u8>, value: u64) {
    if value < VARINT_U16_MARKER as u64 {
        buf.push(value as u8);
    } else if value <= u16::MAX as u64 {
        buf.push(VARINT_U16_MARKER);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= u32::MAX as u64 {
        buf.push(VARINT_U32_MARKER);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(VARINT_U64_MARKER);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_int(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn serialize_header(header: &BlockHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(80);
    buf.extend_from_slice(&header.version.to_le_bytes());
    buf.extend_from_slice(&header.previous_block_hash);
    buf.extend_from_slice(&header.merkle_root);
    buf.extend_from_slice(&header.time.to_le_bytes());
    buf.extend_from_slice(&header.bits.to_le_bytes());
    buf.extend_from_slice(&header.nonce.to_le_bytes());
    buf
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut buf = Vec::new();
    write_transaction(&mut buf, tx);
    buf
}

fn write_transaction(buf: &mut Vec<u8>, tx: &Transaction) {
    buf.extend_from_slice(&tx.version.to_le_bytes());
    write_var_int(buf, tx.inputs.len() as u64);
    for input in &tx.inputs {
        buf.extend_from_slice(&input.prev_output.tx_hash);
        buf.extend_from_slice(&input.prev_output.output_index.to_le_bytes());
        write_var_bytes(buf, &input.script_signature);
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    }
    write_var_int(buf, tx.outputs.len() as u64);
    for output in &tx.outputs {
        buf.extend_from_slice(&(output.value as u64).to_le_bytes());
        write_var_bytes(buf, &output.script_public_key);
    }
    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut buf = serialize_header(&block.header);
    write_var_int(&mut buf, block.transactions.len() as u64);
    for tx in &block.transactions {
        write_transaction(&mut buf, tx);
    }
    buf
}

/// Sequential decoder over a byte slice. Truncation is a structural error.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ChainError::structural(format!(
                "truncated input: wanted {n} bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        let bytes = self.take(32)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    pub fn read_var_int(&mut self) -> Result<u64> {
        let marker = self.read_u8()?;
        match marker {
            VARINT_U16_MARKER => {
                let bytes = self.take(2)?;
                Ok(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
            }
            VARINT_U32_MARKER => Ok(self.read_u32()? as u64),
            VARINT_U64_MARKER => self.read_u64(),
            small => Ok(small as u64),
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<ByteString> {
        let len = self.read_var_int()?;
        if len > self.remaining() as u64 {
            return Err(ChainError::structural(format!(
                "byte string length {len} exceeds remaining input"
            )));
        }
        Ok(self.take(len as usize)?.to_vec())
    }
}

pub fn deserialize_header(bytes: &[u8]) -> Result<BlockHeader> {
    let mut reader = Reader::new(bytes);
    let header = read_header(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(ChainError::structural("trailing bytes after header"));
    }
    Ok(header)
}

fn read_header(reader: &mut Reader) -> Result<BlockHeader> {
    Ok(BlockHeader {
        version: reader.read_i32()?,
        previous_block_hash: reader.read_hash()?,
        merkle_root: reader.read_hash()?,
        time: reader.read_u32()?,
        bits: reader.read_u32()?,
        nonce: reader.read_u32()?,
    })
}

pub fn deserialize_transaction(bytes: &[u8]) -> Result<Transaction> {
    let mut reader = Reader::new(bytes);
    let tx = read_transaction(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(ChainError::structural("trailing bytes after transaction"));
    }
    Ok(tx)
}

fn read_transaction(reader: &mut Reader) -> Result<Transaction> {
    let version = reader.read_u32()?;
    let input_count = reader.read_var_int()?;
    let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
    for _ in 0..input_count {
        inputs.push(TxInput {
            prev_output: OutPoint {
                tx_hash: reader.read_hash()?,
                output_index: reader.read_u32()?,
            },
            script_signature: reader.read_var_bytes()?,
            sequence: reader.read_u32()?,
        });
    }
    let output_count = reader.read_var_int()?;
    let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
    for _ in 0..output_count {
        outputs.push(TxOutput {
            value: reader.read_u64()? as i64,
            script_public_key: reader.read_var_bytes()?,
        });
    }
    let lock_time = reader.read_u32()?;
    Ok(Transaction {
        version,
        inputs,
        outputs,
        lock_time,
    })
}

pub fn deserialize_block(bytes: &[u8]) -> Result<Block> {
    let mut reader = Reader::new(bytes);
    let header = read_header(&mut reader)?;
    let tx_count = reader.read_var_int()?;
    let mut transactions = Vec::with_capacity(tx_count.min(1024) as usize);
    for _ in 0..tx_count {
        transactions.push(read_transaction(&mut reader)?);
    }
    if reader.remaining() != 0 {
        return Err(ChainError::structural("trailing bytes after block"));
    }
    Ok(Block {
        header,
        transactions,
    })
}
