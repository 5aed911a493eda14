/// The 32-bit variant of the Xorshift PRNG algorithm.
///
/// Didn't feel like pulling in the `rand` crate, so have this here beauty instead.
#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct Xorshift32(pub u32);

impl Xorshift32 {
	pub fn from_id(id: &'static str) -> Self {
		let mut seed = 0x9e37_79b9u32;
		for b in id.bytes() {
			seed = seed.rotate_left(5) ^ u32::from(b);
		}
		Self(seed | 1)
	}

	pub fn next(&mut self) -> u32 {
		self.0 ^= self.0 << 13;
		self.0 ^= self.0 >> 17;
		self.0 ^= self.0 << 5;
		self.0
	}
}

impl Iterator for Xorshift32 {
	type Item = u32;
	fn next(&mut self) -> Option<Self::Item> {
		Some(Xorshift32::next(self))
	}
}

macro_rules! make_id {
	() => {
		concat!(file!(), line!(), column!())
	};
}
