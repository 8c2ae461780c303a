pub mod fne;
pub mod routing;
pub mod util;

#[cfg(test)]
pub mod test_util;
