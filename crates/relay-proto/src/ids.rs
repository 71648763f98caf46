use rand::Rng;

/// `uid == 0` is reserved for unsolicited responses; requests draw from
/// `[1, 0xFFFF_FFFE]`.
pub fn generate_uid() -> u32 {
    rand::rng().random_range(1..=0xFFFF_FFFE)
}

/// `socks_id == 0` is `INVALID_SOCKS_ID`; never assigned to a real link.
pub fn generate_socks_id() -> u64 {
    loop {
        let id: u64 = rand::rng().random_range(1..=0xFFFF_FFFF_FFFF_FFFE);
        if id != 0 {
            return id;
        }
    }
}
