//! CRC 校验和计算.
//!
//! CRC-32/MPEG-2 (多项式 0x04C11DB7, 初始值 0xFFFFFFFF, 不反转, 无异或输出),
//! 用于 MPEG-TS 的 PAT/PMT 校验, 以及配置记录变化检测.

/// CRC-32/MPEG-2 查找表
const CRC32_MPEG2_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i << 24;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

/// 计算 CRC-32/MPEG-2
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = (crc << 8) ^ CRC32_MPEG2_TABLE[((crc >> 24) as u8 ^ byte) as usize];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_mpeg2_标准向量() {
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_crc32_mpeg2_空数据() {
        assert_eq!(crc32_mpeg2(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_crc32_mpeg2_pat_段自校验() {
        // 带 CRC 的完整 PSI 段再算一次 CRC 结果为 0
        let section = [0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00];
        let crc = crc32_mpeg2(&section);
        let mut full = section.to_vec();
        full.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(crc32_mpeg2(&full), 0);
    }
}
