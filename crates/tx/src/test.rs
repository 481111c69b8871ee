#[cfg(test)]
mod lob_test;
#[cfg(test)]
mod tx_test;
#[cfg(test)]
mod versioned_test;
