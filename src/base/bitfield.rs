/// A `SIZE`-bit wide field starting at bit `POSITION` of a 64-bit word.
pub struct BitField<const SIZE: usize, const POSITION: usize>;

impl<const SIZE: usize, const POSITION: usize> BitField<SIZE, POSITION> {
    pub const NEXT_BIT: usize = POSITION + SIZE;

    #[inline(always)]
    pub const fn mask() -> u64 {
        if SIZE >= 64 {
            u64::MAX
        } else {
            (1 << SIZE as u64) - 1
        }
    }

    #[inline(always)]
    pub const fn mask_in_place() -> u64 {
        Self::mask() << POSITION as u64
    }

    #[inline(always)]
    pub const fn is_valid(value: u64) -> bool {
        value & !Self::mask() == 0
    }

    #[inline(always)]
    pub const fn decode(word: u64) -> u64 {
        (word >> POSITION as u64) & Self::mask()
    }

    #[inline(always)]
    pub const fn encode(value: u64) -> u64 {
        (value & Self::mask()) << POSITION as u64
    }

    #[inline(always)]
    pub const fn update(value: u64, word: u64) -> u64 {
        Self::encode(value) | (!Self::mask_in_place() & word)
    }
}
