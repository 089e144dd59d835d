#![cfg(test)]
// Suppress 'unused' warnings for the testsuite
#![allow(unused)]

mod poll_test;
mod test_net;
